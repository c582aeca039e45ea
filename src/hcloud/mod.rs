//! Hetzner Cloud implementation of [`Provider`].
//!
//! Talks to the public REST API with a bearer token. Every mutating call
//! returns the provider action that completes it; [`Provider::wait_for_actions`]
//! polls those until they settle.

mod actions;
mod error;
mod types;

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::config::HcloudConfig;
use crate::provider::{
    ActionHandle, CreatedImage, CreatedServer, ImageSpec, LabeledResource, Provider,
    ProviderFuture, ServerSpec, SshKeyHandle,
};
use types::{
    ActionEnvelope, CreateImageBody, CreateImageEnvelope, CreateServerBody, CreateServerEnvelope,
    CreateSshKeyBody, EnableRescueBody, ErrorEnvelope, ServerPage, SshKeyEnvelope, SshKeyPage,
};

pub use error::HcloudError;

const PAGE_SIZE: &str = "50";
const SNAPSHOT_IMAGE_TYPE: &str = "snapshot";

/// Provider backed by the Hetzner Cloud API.
#[derive(Clone)]
pub struct HcloudProvider {
    client: Client,
    endpoint: String,
    token: String,
    poll_interval: Duration,
    action_timeout: Duration,
}

impl std::fmt::Debug for HcloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HcloudProvider")
            .field("endpoint", &self.endpoint)
            .field("poll_interval", &self.poll_interval)
            .field("action_timeout", &self.action_timeout)
            .finish_non_exhaustive()
    }
}

impl HcloudProvider {
    /// Constructs a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HcloudError::Config`] when the configuration fails
    /// validation or the HTTP client cannot be built.
    pub fn new(config: &HcloudConfig) -> Result<Self, HcloudError> {
        config.validate()?;
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| HcloudError::Config(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
            token: config.token.clone(),
            poll_interval: config.poll_interval(),
            action_timeout: config.action_timeout(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.endpoint))
            .bearer_auth(&self.token)
    }

    /// Sends a request and decodes the JSON body, mapping error statuses to
    /// [`HcloudError::Api`].
    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        builder: RequestBuilder,
    ) -> Result<T, HcloudError> {
        let body = self.send_raw(path, builder).await?;
        serde_json::from_str(&body).map_err(|err| HcloudError::Decode {
            path: path.to_owned(),
            message: err.to_string(),
        })
    }

    async fn send_raw(&self, path: &str, builder: RequestBuilder) -> Result<String, HcloudError> {
        let http_error = |err: reqwest::Error| HcloudError::Http {
            path: path.to_owned(),
            message: err.to_string(),
        };
        let response = builder.send().await.map_err(http_error)?;
        let status = response.status();
        let body = response.text().await.map_err(http_error)?;
        if status.is_success() {
            return Ok(body);
        }
        Err(api_error(path, status, &body))
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, HcloudError> {
        self.send(path, self.request(Method::POST, path).json(body))
            .await
    }

    async fn list_pages<P, F>(
        &self,
        path: &str,
        label_selector: &str,
        mut unpack: F,
    ) -> Result<Vec<LabeledResource>, HcloudError>
    where
        P: DeserializeOwned,
        F: FnMut(P) -> (Vec<types::Named>, Option<u64>),
    {
        let mut resources = Vec::new();
        let mut page: u64 = 1;
        loop {
            let page_text = page.to_string();
            let builder = self.request(Method::GET, path).query(&[
                ("label_selector", label_selector),
                ("page", page_text.as_str()),
                ("per_page", PAGE_SIZE),
            ]);
            let (items, next_page) = unpack(self.send::<P>(path, builder).await?);
            resources.extend(items.into_iter().map(LabeledResource::from));
            match next_page {
                Some(next) if next > page => page = next,
                _ => return Ok(resources),
            }
        }
    }
}

fn api_error(path: &str, status: StatusCode, body: &str) -> HcloudError {
    let (code, message) = serde_json::from_str::<ErrorEnvelope>(body).map_or_else(
        |_| {
            (
                String::from("unknown"),
                status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_owned(),
            )
        },
        |envelope| (envelope.error.code, envelope.error.message),
    );
    HcloudError::Api {
        path: path.to_owned(),
        status: status.as_u16(),
        code,
        message,
    }
}

impl Provider for HcloudProvider {
    type Error = HcloudError;

    fn create_ssh_key<'a>(
        &'a self,
        name: &'a str,
        public_key: &'a str,
        labels: &'a BTreeMap<String, String>,
    ) -> ProviderFuture<'a, SshKeyHandle, Self::Error> {
        Box::pin(async move {
            let body = CreateSshKeyBody {
                name,
                public_key,
                labels,
            };
            let envelope: SshKeyEnvelope = self.post("/ssh_keys", &body).await?;
            Ok(envelope.ssh_key.into())
        })
    }

    fn delete_ssh_key(&self, id: u64) -> ProviderFuture<'_, (), Self::Error> {
        Box::pin(async move {
            let path = format!("/ssh_keys/{id}");
            self.send_raw(&path, self.request(Method::DELETE, &path))
                .await
                .map(|_| ())
        })
    }

    fn create_server<'a>(
        &'a self,
        spec: &'a ServerSpec,
    ) -> ProviderFuture<'a, CreatedServer, Self::Error> {
        Box::pin(async move {
            let body = CreateServerBody {
                name: &spec.name,
                server_type: &spec.server_type,
                image: &spec.image,
                location: &spec.location,
                ssh_keys: &spec.ssh_keys,
                start_after_create: spec.start_after_create,
                labels: &spec.labels,
            };
            let envelope: CreateServerEnvelope = self.post("/servers", &body).await?;
            let actions = std::iter::once(envelope.action)
                .chain(envelope.next_actions)
                .map(ActionHandle::from)
                .collect();
            Ok(CreatedServer {
                server: envelope.server.into(),
                actions,
            })
        })
    }

    fn delete_server(&self, id: u64) -> ProviderFuture<'_, ActionHandle, Self::Error> {
        Box::pin(async move {
            let path = format!("/servers/{id}");
            let envelope: ActionEnvelope =
                self.send(&path, self.request(Method::DELETE, &path)).await?;
            Ok(envelope.action.into())
        })
    }

    fn enable_rescue<'a>(
        &'a self,
        server_id: u64,
        rescue_type: &'a str,
        ssh_keys: &'a [u64],
    ) -> ProviderFuture<'a, ActionHandle, Self::Error> {
        Box::pin(async move {
            let path = format!("/servers/{server_id}/actions/enable_rescue");
            let body = EnableRescueBody {
                rescue_type,
                ssh_keys,
            };
            let envelope: ActionEnvelope = self.post(&path, &body).await?;
            Ok(envelope.action.into())
        })
    }

    fn power_on(&self, server_id: u64) -> ProviderFuture<'_, ActionHandle, Self::Error> {
        Box::pin(async move {
            let path = format!("/servers/{server_id}/actions/poweron");
            let envelope: ActionEnvelope =
                self.send(&path, self.request(Method::POST, &path)).await?;
            Ok(envelope.action.into())
        })
    }

    fn create_image<'a>(
        &'a self,
        server_id: u64,
        spec: &'a ImageSpec,
    ) -> ProviderFuture<'a, CreatedImage, Self::Error> {
        Box::pin(async move {
            let path = format!("/servers/{server_id}/actions/create_image");
            let body = CreateImageBody {
                image_type: SNAPSHOT_IMAGE_TYPE,
                description: spec.description.as_deref(),
                labels: &spec.labels,
            };
            let envelope: CreateImageEnvelope = self.post(&path, &body).await?;
            Ok(CreatedImage {
                image: envelope.image.into(),
                action: envelope.action.into(),
            })
        })
    }

    fn wait_for_actions<'a>(
        &'a self,
        actions: &'a [ActionHandle],
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move { self.poll_actions(actions, cancel).await })
    }

    fn list_servers<'a>(
        &'a self,
        label_selector: &'a str,
    ) -> ProviderFuture<'a, Vec<LabeledResource>, Self::Error> {
        Box::pin(async move {
            self.list_pages("/servers", label_selector, |page: ServerPage| {
                (page.servers, page.meta.pagination.next_page)
            })
            .await
        })
    }

    fn list_ssh_keys<'a>(
        &'a self,
        label_selector: &'a str,
    ) -> ProviderFuture<'a, Vec<LabeledResource>, Self::Error> {
        Box::pin(async move {
            self.list_pages("/ssh_keys", label_selector, |page: SshKeyPage| {
                (page.ssh_keys, page.meta.pagination.next_page)
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> HcloudConfig {
        HcloudConfig {
            token: String::from("secret"),
            endpoint: String::from("https://api.example.test/v1/"),
            location: String::from("fsn1"),
            base_image: String::from("ubuntu-24.04"),
            rescue_type: String::from("linux64"),
            poll_interval_ms: 250,
            action_timeout_secs: 30,
        }
    }

    #[rstest]
    fn new_trims_trailing_slash(config: HcloudConfig) {
        let provider = HcloudProvider::new(&config).expect("provider");
        assert_eq!(provider.endpoint, "https://api.example.test/v1");
        assert_eq!(provider.poll_interval, Duration::from_millis(250));
        assert_eq!(provider.action_timeout, Duration::from_secs(30));
    }

    #[rstest]
    fn new_rejects_missing_token(config: HcloudConfig) {
        let tokenless = HcloudConfig {
            token: String::new(),
            ..config
        };
        let err = HcloudProvider::new(&tokenless).expect_err("missing token");
        assert!(
            matches!(err, HcloudError::Config(ref message) if message.contains("HCLOUD_TOKEN")),
            "unexpected error: {err}"
        );
    }

    #[rstest]
    fn debug_output_hides_token(config: HcloudConfig) {
        let provider = HcloudProvider::new(&config).expect("provider");
        assert!(!format!("{provider:?}").contains("secret"));
    }

    #[test]
    fn api_error_reads_error_envelope() {
        let body = r#"{"error":{"code":"uniqueness_error","message":"SSH key with the same fingerprint already exists","details":{}}}"#;
        let err = api_error("/ssh_keys", StatusCode::CONFLICT, body);
        assert_eq!(
            err,
            HcloudError::Api {
                path: String::from("/ssh_keys"),
                status: 409,
                code: String::from("uniqueness_error"),
                message: String::from("SSH key with the same fingerprint already exists"),
            }
        );
    }

    #[test]
    fn api_error_falls_back_to_status_text() {
        let err = api_error("/servers/1", StatusCode::NOT_FOUND, "<html>nope</html>");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Not Found"), "unexpected: {err}");
    }
}
