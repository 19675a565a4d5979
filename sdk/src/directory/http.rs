use {
    super::{DirectoryError, KeyDirectory},
    crate::key_manager::{KeysForServer, PreKeyBundleDto},
    async_trait::async_trait,
    reqwest::{Client, RequestBuilder, Response, StatusCode, Url},
    serde::Deserialize,
};

/// Default REST endpoint of a locally running backend.
pub const DEFAULT_DIRECTORY_URL: &str = "http://localhost:3001/api";

/// Builder for [`HttpKeyDirectory`] configuration
pub struct HttpKeyDirectoryBuilder {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl Default for HttpKeyDirectoryBuilder {
    fn default() -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_DIRECTORY_URL.to_string(),
            auth_token: None,
        }
    }
}

impl HttpKeyDirectoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a custom HTTP client
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Set the API root, e.g. `https://chat.example/api`
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_string());
        self
    }

    pub fn build(self) -> HttpKeyDirectory {
        HttpKeyDirectory {
            client: self.client,
            base_url: self.base_url,
            auth_token: self.auth_token,
        }
    }
}

/// [`KeyDirectory`] backed by the chat backend's REST API.
pub struct HttpKeyDirectory {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl Default for HttpKeyDirectory {
    fn default() -> Self {
        HttpKeyDirectoryBuilder::default().build()
    }
}

/// Error body returned by the backend.
#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl HttpKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> HttpKeyDirectoryBuilder {
        HttpKeyDirectoryBuilder::default()
    }

    /// `base_url` joined with percent-encoded `segments`.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, DirectoryError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| DirectoryError::Other(format!("invalid directory URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| DirectoryError::Other(format!("invalid directory URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn rejection(response: Response) -> DirectoryError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.message)
            .unwrap_or(text);

        DirectoryError::Rejected { status, message }
    }
}

#[async_trait]
impl KeyDirectory for HttpKeyDirectory {
    async fn fetch_bundle(&self, peer: &str) -> Result<PreKeyBundleDto, DirectoryError> {
        let url = self.endpoint(&["keys", "bundle", peer])?;
        let response = self.authorize(self.client.get(url)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(peer.to_string())),
            status if status.is_success() => Ok(response.json().await?),
            _ => Err(Self::rejection(response).await),
        }
    }

    async fn register(&self, keys: &KeysForServer) -> Result<(), DirectoryError> {
        let url = self.endpoint(&["keys", "register"])?;
        let response = self
            .authorize(self.client.post(url))
            .json(keys)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }

        Ok(())
    }
}
