//! IPFS blob store
//!
//! Talks to a Kubo node over its RPC API. The node is constructed once at
//! startup and passed to the services that need it.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;

use crate::config::Config;

/// Streamed blob contents
pub type BlobStream = BoxStream<'static, IpfsResult<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum IpfsError {
    #[error("IPFS request failed: {0}")]
    Request(String),

    #[error("Timeout waiting for IPFS node")]
    Timeout,

    #[error("IPFS node returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response from IPFS node: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for IpfsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            IpfsError::Timeout
        } else {
            IpfsError::Request(err.to_string())
        }
    }
}

pub type IpfsResult<T> = Result<T, IpfsError>;

/// Result of adding a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedBlob {
    pub cid: String,
    /// Size as reported by the node (includes DAG overhead)
    pub size: u64,
}

/// Content-addressed blob storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` without pinning it
    async fn add(&self, filename: Option<&str>, data: Bytes) -> IpfsResult<AddedBlob>;

    async fn cat(&self, cid: &str) -> IpfsResult<BlobStream>;

    async fn pin(&self, cid: &str) -> IpfsResult<()>;

    /// Unpinning content that is not pinned succeeds
    async fn unpin(&self, cid: &str) -> IpfsResult<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: String,
    size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KuboErrorBody {
    message: String,
}

/// Kubo RPC client
#[derive(Clone)]
pub struct KuboClient {
    http: Client,
    base_url: String,
}

impl KuboClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> IpfsResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config) -> IpfsResult<Self> {
        Self::new(config.ipfs_api_url.clone(), config.ipfs_timeout)
    }

    fn url(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.base_url, command)
    }

    async fn post_arg(&self, command: &str, cid: &str) -> IpfsResult<Response> {
        let response = self
            .http
            .post(self.url(command))
            .query(&[("arg", cid)])
            .send()
            .await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> IpfsResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<KuboErrorBody>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    Err(IpfsError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl BlobStore for KuboClient {
    async fn add(&self, filename: Option<&str>, data: Bytes) -> IpfsResult<AddedBlob> {
        let length = data.len() as u64;
        let part = Part::stream_with_length(reqwest::Body::from(data), length)
            .file_name(filename.unwrap_or("blob").to_string());
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(self.url("add"))
            .query(&[("pin", "false")])
            .multipart(form)
            .send()
            .await?;
        let response = check_status(response).await?;

        let added: AddResponse = response
            .json()
            .await
            .map_err(|e| IpfsError::InvalidResponse(e.to_string()))?;
        let size = added
            .size
            .parse()
            .map_err(|_| IpfsError::InvalidResponse(format!("size {:?}", added.size)))?;

        tracing::debug!(cid = %added.hash, size, "Blob added");
        Ok(AddedBlob { cid: added.hash, size })
    }

    async fn cat(&self, cid: &str) -> IpfsResult<BlobStream> {
        let response = self.post_arg("cat", cid).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(IpfsError::from))
            .boxed())
    }

    async fn pin(&self, cid: &str) -> IpfsResult<()> {
        self.post_arg("pin/add", cid).await?;
        tracing::debug!(cid = %cid, "Blob pinned");
        Ok(())
    }

    async fn unpin(&self, cid: &str) -> IpfsResult<()> {
        match self.post_arg("pin/rm", cid).await {
            Ok(_) => Ok(()),
            Err(IpfsError::Api { message, .. }) if message.contains("not pinned") => {
                tracing::debug!(cid = %cid, "Unpin of content that was not pinned");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use mockito::Matcher;

    const CID: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";

    async fn collect(stream: BlobStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_unpinned() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v0/add")
            .match_query(Matcher::UrlEncoded("pin".into(), "false".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"Name":"hello.txt","Hash":"{}","Size":"19"}}"#, CID))
            .create_async()
            .await;

        let client = KuboClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let added = client
            .add(Some("hello.txt"), Bytes::from_static(b"hello, ipfs"))
            .await
            .unwrap();

        assert_eq!(added, AddedBlob { cid: CID.to_string(), size: 19 });
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cat_streams_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v0/cat")
            .match_query(Matcher::UrlEncoded("arg".into(), CID.into()))
            .with_status(200)
            .with_body("hello, ipfs")
            .create_async()
            .await;

        let client = KuboClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let stream = client.cat(CID).await.unwrap();
        assert_eq!(collect(stream).await, b"hello, ipfs");
    }

    #[tokio::test]
    async fn test_node_error_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v0/pin/add")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body(r#"{"Message":"invalid path \"nope\"","Code":0,"Type":"error"}"#)
            .create_async()
            .await;

        let client = KuboClient::new(server.url(), Duration::from_secs(5)).unwrap();
        match client.pin("nope").await {
            Err(IpfsError::Api { status, message }) => {
                assert_eq!(status, 500);
                assert!(message.contains("invalid path"));
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unpin_not_pinned_is_ok() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v0/pin/rm")
            .match_query(Matcher::UrlEncoded("arg".into(), CID.into()))
            .with_status(500)
            .with_body(r#"{"Message":"not pinned or pinned indirectly","Code":0,"Type":"error"}"#)
            .create_async()
            .await;

        let client = KuboClient::new(server.url(), Duration::from_secs(5)).unwrap();
        assert!(client.unpin(CID).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let client = KuboClient::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let result = client.add(None, Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(IpfsError::Request(_)) | Err(IpfsError::Timeout)));
    }
}
