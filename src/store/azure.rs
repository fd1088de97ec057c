//! Azure Blob Storage 后端：直接调用 Blob REST API。
//!
//! 每个命名空间映射到一个 Azure 容器。认证支持 Shared Key（HMAC-SHA256
//! 签名）与 SAS token，两者都从连接字符串中读取；
//! `UseDevelopmentStorage=true` 指向本地 Azurite。

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use hmac::{Hmac, Mac};
use percent_encoding::utf8_percent_encode;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode, Url};
use sha2::Sha256;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use xmltree::Element;

use super::{
    BlobContent, BlobEntry, BlobStore, BlobStream, NamespaceStream, StoreError, URL_SEGMENT,
    check_blob_name,
};
use crate::namespace::NamespaceKey;

const AZURE_API_VERSION: &str = "2023-11-03";
const DEV_ACCOUNT_NAME: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

#[derive(Debug, PartialEq)]
enum AzureAuth {
    SharedKey { key: Vec<u8> },
    SasToken { token: String },
}

#[derive(Debug, PartialEq)]
struct ConnectionSettings {
    account: String,
    endpoint: String,
    auth: AzureAuth,
}

pub struct AzureBlobStore {
    client: reqwest::Client,
    account: String,
    endpoint: String,
    endpoint_path: String,
    auth: AzureAuth,
}

struct BlobPage {
    entries: Vec<BlobEntry>,
    next_marker: Option<String>,
}

struct ContainerPage {
    names: Vec<NamespaceKey>,
    next_marker: Option<String>,
}

fn invalid_config(msg: impl Into<String>) -> StoreError {
    StoreError::Unavailable(format!("invalid azure connection string: {}", msg.into()))
}

fn parse_connection_string(raw: &str) -> Result<ConnectionSettings, StoreError> {
    let mut fields = HashMap::new();
    for part in raw.split(';').map(str::trim).filter(|part| !part.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| invalid_config(format!("malformed segment {part:?}")))?;
        fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    if fields
        .get("usedevelopmentstorage")
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    {
        return Ok(ConnectionSettings {
            account: DEV_ACCOUNT_NAME.to_string(),
            endpoint: DEV_BLOB_ENDPOINT.to_string(),
            auth: AzureAuth::SharedKey {
                key: decode_key(DEV_ACCOUNT_KEY)?,
            },
        });
    }

    let account = fields.remove("accountname").unwrap_or_default();
    let endpoint = match fields.remove("blobendpoint") {
        Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
        None => {
            if account.is_empty() {
                return Err(invalid_config("AccountName or BlobEndpoint is required"));
            }
            let protocol = fields
                .remove("defaultendpointsprotocol")
                .unwrap_or_else(|| "https".to_string());
            let suffix = fields
                .remove("endpointsuffix")
                .unwrap_or_else(|| "core.windows.net".to_string());
            format!("{protocol}://{account}.blob.{suffix}")
        }
    };

    let auth = if let Some(key) = fields.remove("accountkey") {
        if account.is_empty() {
            return Err(invalid_config("AccountName is required with AccountKey"));
        }
        AzureAuth::SharedKey {
            key: decode_key(&key)?,
        }
    } else if let Some(token) = fields.remove("sharedaccesssignature") {
        AzureAuth::SasToken {
            token: token.trim_start_matches('?').to_string(),
        }
    } else {
        return Err(invalid_config(
            "AccountKey or SharedAccessSignature is required",
        ));
    };

    Ok(ConnectionSettings {
        account,
        endpoint,
        auth,
    })
}

fn decode_key(key: &str) -> Result<Vec<u8>, StoreError> {
    BASE64_STANDARD
        .decode(key)
        .map_err(|err| invalid_config(format!("AccountKey is not base64: {err}")))
}

/// Azure 容器命名规则：3–63 个小写字母、数字或连字符，首尾不为连字符，
/// 不允许连续连字符。
fn check_container_name(namespace: &NamespaceKey) -> Result<(), StoreError> {
    let name = namespace.as_str();
    let bytes = name.as_bytes();
    let valid = (3..=63).contains(&bytes.len())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
        && !name.contains("--");
    if !valid {
        return Err(StoreError::InvalidNamespace(name.to_string()));
    }
    Ok(())
}

fn string_to_sign(
    method: &str,
    content_length: usize,
    content_type: &str,
    ms_headers: &[(&str, &str)],
    canonical_resource: &str,
) -> String {
    let mut headers: Vec<(String, &str)> = ms_headers
        .iter()
        .map(|(key, value)| (key.to_ascii_lowercase(), value.trim()))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical_headers = headers
        .iter()
        .map(|(key, value)| format!("{key}:{value}"))
        .collect::<Vec<_>>()
        .join("\n");
    let content_length = match content_length {
        0 => String::new(),
        len => len.to_string(),
    };
    format!(
        "{method}\n\n\n{content_length}\n\n{content_type}\n\n\n\n\n\n\n{canonical_headers}\n{canonical_resource}"
    )
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    element
        .get_child(name)
        .and_then(|child| child.get_text())
        .map(|text| text.into_owned())
}

fn child_elements<'e>(element: &'e Element, name: &'e str) -> impl Iterator<Item = &'e Element> {
    element
        .children
        .iter()
        .filter_map(|node| node.as_element())
        .filter(move |child| child.name == name)
}

fn parse_xml(body: &[u8]) -> Result<Element, StoreError> {
    Element::parse(body).map_err(|err| StoreError::Unavailable(format!("bad azure xml: {err}")))
}

fn next_marker(root: &Element) -> Option<String> {
    child_text(root, "NextMarker").filter(|marker| !marker.is_empty())
}

fn parse_blob_page(
    body: &[u8],
    namespace: &NamespaceKey,
    endpoint: &str,
) -> Result<BlobPage, StoreError> {
    let root = parse_xml(body)?;
    let mut entries = Vec::new();
    if let Some(blobs) = root.get_child("Blobs") {
        for blob in child_elements(blobs, "Blob") {
            let Some(name) = child_text(blob, "Name") else {
                continue;
            };
            let properties = blob.get_child("Properties");
            let timestamp = properties
                .and_then(|props| {
                    child_text(props, "Creation-Time").or_else(|| child_text(props, "Last-Modified"))
                })
                .ok_or_else(|| {
                    StoreError::Unavailable(format!("blob {name} has no creation time"))
                })?;
            let created = httpdate::parse_http_date(&timestamp).map_err(|err| {
                StoreError::Unavailable(format!("bad creation time {timestamp:?}: {err}"))
            })?;
            entries.push(BlobEntry {
                namespace: namespace.clone(),
                url: format!(
                    "{endpoint}/{}/{}",
                    namespace,
                    utf8_percent_encode(&name, URL_SEGMENT)
                ),
                name,
                created_on: DateTime::<Utc>::from(created),
            });
        }
    }
    Ok(BlobPage {
        entries,
        next_marker: next_marker(&root),
    })
}

fn parse_container_page(body: &[u8]) -> Result<ContainerPage, StoreError> {
    let root = parse_xml(body)?;
    let names = root
        .get_child("Containers")
        .map(|containers| {
            child_elements(containers, "Container")
                .filter_map(|container| child_text(container, "Name"))
                .map(NamespaceKey::from_backend)
                .collect()
        })
        .unwrap_or_default();
    Ok(ContainerPage {
        names,
        next_marker: next_marker(&root),
    })
}

fn error_code(response: &Response) -> String {
    response
        .headers()
        .get("x-ms-error-code")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn failure(operation: &str, response: Response) -> StoreError {
    let status = response.status();
    let code = error_code(&response);
    let body = response.text().await.unwrap_or_default();
    debug!(operation, %status, code, body, "azure request failed");
    StoreError::Unavailable(format!("azure {operation}: HTTP {status} {code}"))
}

impl AzureBlobStore {
    pub fn from_connection_string(raw: &str, timeout: Duration) -> Result<Self, StoreError> {
        let settings = parse_connection_string(raw)?;
        let endpoint_path = Url::parse(&settings.endpoint)
            .map_err(|err| invalid_config(format!("bad blob endpoint: {err}")))?
            .path()
            .trim_end_matches('/')
            .to_string();
        let mut builder = reqwest::Client::builder();
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| StoreError::Unavailable(format!("http client: {err}")))?;
        info!(
            account = settings.account,
            endpoint = settings.endpoint,
            "azure blob backend configured"
        );
        Ok(Self {
            client,
            account: settings.account,
            endpoint: settings.endpoint,
            endpoint_path,
            auth: settings.auth,
        })
    }

    fn blob_path(namespace: &NamespaceKey, blob_name: &str) -> String {
        format!("/{}/{}", namespace, utf8_percent_encode(blob_name, URL_SEGMENT))
    }

    fn canonical_resource(&self, path: &str, query: &[(&str, &str)]) -> String {
        let mut resource = format!("/{}{}{}", self.account, self.endpoint_path, path);
        let mut params: Vec<(String, &str)> = query
            .iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), *value))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in params {
            resource.push('\n');
            resource.push_str(&key);
            resource.push(':');
            resource.push_str(value);
        }
        resource
    }

    fn sign(&self, key: &[u8], to_sign: &str) -> Result<String, StoreError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key)
            .map_err(|err| StoreError::Unavailable(format!("hmac key: {err}")))?;
        mac.update(to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        extra_headers: &[(&str, &str)],
        body: Option<(Bytes, String)>,
    ) -> Result<Response, StoreError> {
        let mut url = Url::parse(&format!("{}{}", self.endpoint, path))
            .map_err(|err| StoreError::Unavailable(format!("bad url: {err}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        if let AzureAuth::SasToken { token } = &self.auth {
            let merged = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{token}"),
                _ => token.clone(),
            };
            url.set_query(Some(&merged));
        }

        let date = httpdate::fmt_http_date(SystemTime::now());
        let mut request = self
            .client
            .request(method.clone(), url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION);
        for (key, value) in extra_headers {
            request = request.header(*key, *value);
        }

        let (content_length, content_type) = match &body {
            Some((bytes, content_type)) => (bytes.len(), content_type.as_str()),
            None => (0, ""),
        };
        if let AzureAuth::SharedKey { key } = &self.auth {
            let mut ms_headers = vec![("x-ms-date", date.as_str()), ("x-ms-version", AZURE_API_VERSION)];
            ms_headers.extend(extra_headers.iter().copied());
            let to_sign = string_to_sign(
                method.as_str(),
                content_length,
                content_type,
                &ms_headers,
                &self.canonical_resource(path, query),
            );
            request = request.header(AUTHORIZATION, self.sign(key, &to_sign)?);
        }

        request = match body {
            Some((bytes, content_type)) => request.header(CONTENT_TYPE, content_type).body(bytes),
            None if method == Method::PUT => request.header(CONTENT_LENGTH, "0"),
            None => request,
        };

        request
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(format!("azure request failed: {err}")))
    }

    async fn list_blob_page(
        &self,
        namespace: &NamespaceKey,
        marker: &str,
    ) -> Result<BlobPage, StoreError> {
        check_container_name(namespace)?;
        let mut query = vec![("restype", "container"), ("comp", "list")];
        if !marker.is_empty() {
            query.push(("marker", marker));
        }
        let path = format!("/{namespace}");
        let response = self.send(Method::GET, &path, &query, &[], None).await?;
        if response.status() != StatusCode::OK {
            return Err(failure("list blobs", response).await);
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        parse_blob_page(&body, namespace, &self.endpoint)
    }

    async fn list_container_page(&self, marker: &str) -> Result<ContainerPage, StoreError> {
        let mut query = vec![("comp", "list")];
        if !marker.is_empty() {
            query.push(("marker", marker));
        }
        let response = self.send(Method::GET, "/", &query, &[], None).await?;
        if response.status() != StatusCode::OK {
            return Err(failure("list containers", response).await);
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        parse_container_page(&body)
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    fn kind(&self) -> &'static str {
        "azure"
    }

    async fn ensure_container(&self, namespace: &NamespaceKey) -> Result<(), StoreError> {
        check_container_name(namespace)?;
        let path = format!("/{namespace}");
        let response = self
            .send(Method::PUT, &path, &[("restype", "container")], &[], None)
            .await?;
        match response.status() {
            StatusCode::CREATED => {
                info!(%namespace, "container created");
                Ok(())
            }
            StatusCode::CONFLICT if error_code(&response) == "ContainerAlreadyExists" => Ok(()),
            StatusCode::BAD_REQUEST if error_code(&response) == "InvalidResourceName" => {
                Err(StoreError::InvalidNamespace(namespace.to_string()))
            }
            _ => Err(failure("create container", response).await),
        }
    }

    async fn put_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
        source: &Path,
    ) -> Result<(), StoreError> {
        check_container_name(namespace)?;
        check_blob_name(blob_name)?;
        let data = tokio::fs::read(source)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let content_type = mime_guess::from_path(blob_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let response = self
            .send(
                Method::PUT,
                &Self::blob_path(namespace, blob_name),
                &[],
                &[("x-ms-blob-type", "BlockBlob")],
                Some((Bytes::from(data), content_type)),
            )
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(failure("put blob", response).await);
        }
        Ok(())
    }

    fn list_blobs<'a>(&'a self, namespace: &'a NamespaceKey) -> BlobStream<'a> {
        stream::try_unfold(Some(String::new()), move |marker| async move {
            let Some(marker) = marker else {
                return Ok(None);
            };
            let page = self.list_blob_page(namespace, &marker).await?;
            let entries = stream::iter(page.entries.into_iter().map(Ok::<_, StoreError>));
            Ok::<_, StoreError>(Some((entries, page.next_marker)))
        })
        .try_flatten()
        .boxed()
    }

    async fn delete_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
    ) -> Result<(), StoreError> {
        check_container_name(namespace)?;
        check_blob_name(blob_name)?;
        let response = self
            .send(
                Method::DELETE,
                &Self::blob_path(namespace, blob_name),
                &[],
                &[],
                None,
            )
            .await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(blob_name.to_string())),
            _ => Err(failure("delete blob", response).await),
        }
    }

    fn list_containers(&self) -> NamespaceStream<'_> {
        stream::try_unfold(Some(String::new()), move |marker| async move {
            let Some(marker) = marker else {
                return Ok(None);
            };
            let page = self.list_container_page(&marker).await?;
            let names = stream::iter(page.names.into_iter().map(Ok::<_, StoreError>));
            Ok::<_, StoreError>(Some((names, page.next_marker)))
        })
        .try_flatten()
        .boxed()
    }

    async fn open_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
    ) -> Result<BlobContent, StoreError> {
        check_container_name(namespace)?;
        check_blob_name(blob_name)?;
        let response = self
            .send(
                Method::GET,
                &Self::blob_path(namespace, blob_name),
                &[],
                &[],
                None,
            )
            .await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(StoreError::NotFound(blob_name.to_string())),
            _ => return Err(failure("get blob", response).await),
        }
        let size = response.content_length();
        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(BlobContent {
            size,
            reader: Box::pin(StreamReader::new(stream)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::resolve;

    #[test]
    fn account_key_connection_string() {
        let settings = parse_connection_string(
            "DefaultEndpointsProtocol=https;AccountName=acme;AccountKey=c2VjcmV0;EndpointSuffix=core.windows.net",
        )
        .expect("parse");
        assert_eq!(settings.account, "acme");
        assert_eq!(settings.endpoint, "https://acme.blob.core.windows.net");
        assert_eq!(
            settings.auth,
            AzureAuth::SharedKey {
                key: b"secret".to_vec()
            }
        );
    }

    #[test]
    fn sas_connection_string_with_endpoint() {
        let settings = parse_connection_string(
            "BlobEndpoint=https://acme.blob.core.windows.net/;SharedAccessSignature=?sv=2022&sig=abc%3D",
        )
        .expect("parse");
        assert_eq!(settings.endpoint, "https://acme.blob.core.windows.net");
        assert_eq!(
            settings.auth,
            AzureAuth::SasToken {
                token: "sv=2022&sig=abc%3D".to_string()
            }
        );
    }

    #[test]
    fn development_storage_points_at_azurite() {
        let settings = parse_connection_string("UseDevelopmentStorage=true").expect("parse");
        assert_eq!(settings.account, DEV_ACCOUNT_NAME);
        assert_eq!(settings.endpoint, DEV_BLOB_ENDPOINT);
    }

    #[test]
    fn connection_string_without_credentials_is_rejected() {
        assert!(parse_connection_string("AccountName=acme").is_err());
        assert!(parse_connection_string("AccountName=acme;AccountKey=***").is_err());
        assert!(parse_connection_string("garbage").is_err());
    }

    #[test]
    fn container_names_follow_azure_rules() {
        assert!(check_container_name(&resolve("alice")).is_ok());
        assert!(check_container_name(&resolve("team-42")).is_ok());
        for bad in ["ab", "-alice", "alice-", "al--ice", "al ice", "al_ice", ""] {
            assert!(
                matches!(
                    check_container_name(&resolve(bad)),
                    Err(StoreError::InvalidNamespace(_))
                ),
                "{bad:?} should be rejected"
            );
        }
        assert!(check_container_name(&resolve(&"a".repeat(64))).is_err());
    }

    #[test]
    fn string_to_sign_layout() {
        let to_sign = string_to_sign(
            "PUT",
            11,
            "text/plain",
            &[
                ("x-ms-version", AZURE_API_VERSION),
                ("x-ms-blob-type", "BlockBlob"),
                ("x-ms-date", "Mon, 01 Jan 2024 00:00:00 GMT"),
            ],
            "/acme/alice/report.pdf",
        );
        let expected = format!(
            "PUT\n\n\n11\n\ntext/plain\n\n\n\n\n\n\nx-ms-blob-type:BlockBlob\nx-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\nx-ms-version:{AZURE_API_VERSION}\n/acme/alice/report.pdf"
        );
        assert_eq!(to_sign, expected);

        let empty = string_to_sign("GET", 0, "", &[], "/acme/");
        assert_eq!(empty, "GET\n\n\n\n\n\n\n\n\n\n\n\n\n/acme/");
    }

    #[test]
    fn canonical_resource_sorts_query() {
        let store = AzureBlobStore::from_connection_string(
            "UseDevelopmentStorage=true",
            Duration::from_secs(5),
        )
        .expect("store");
        let resource =
            store.canonical_resource("/alice", &[("restype", "container"), ("comp", "list")]);
        assert_eq!(
            resource,
            "/devstoreaccount1/devstoreaccount1/alice\ncomp:list\nrestype:container"
        );
    }

    #[test]
    fn blob_listing_xml_is_parsed() {
        let xml = br#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acme.blob.core.windows.net/" ContainerName="alice">
  <Blobs>
    <Blob>
      <Name>report.pdf</Name>
      <Properties>
        <Creation-Time>Tue, 15 Nov 2022 13:46:39 GMT</Creation-Time>
        <Last-Modified>Wed, 16 Nov 2022 08:00:00 GMT</Last-Modified>
      </Properties>
    </Blob>
    <Blob>
      <Name>my notes.txt</Name>
      <Properties>
        <Last-Modified>Wed, 16 Nov 2022 08:00:00 GMT</Last-Modified>
      </Properties>
    </Blob>
  </Blobs>
  <NextMarker>page-2</NextMarker>
</EnumerationResults>"#;
        let ns = resolve("alice");
        let page = parse_blob_page(xml, &ns, "https://acme.blob.core.windows.net").expect("parse");
        assert_eq!(page.next_marker.as_deref(), Some("page-2"));
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].name, "report.pdf");
        assert_eq!(
            page.entries[0].url,
            "https://acme.blob.core.windows.net/alice/report.pdf"
        );
        assert_eq!(page.entries[0].created_on.timestamp(), 1_668_519_999);
        assert_eq!(
            page.entries[1].url,
            "https://acme.blob.core.windows.net/alice/my%20notes.txt"
        );
    }

    #[test]
    fn container_listing_xml_is_parsed() {
        let xml = br#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acme.blob.core.windows.net/">
  <Containers>
    <Container><Name>alice</Name><Properties/></Container>
    <Container><Name>shared</Name><Properties/></Container>
  </Containers>
  <NextMarker />
</EnumerationResults>"#;
        let page = parse_container_page(xml).expect("parse");
        let names: Vec<_> = page.names.iter().map(|ns| ns.to_string()).collect();
        assert_eq!(names, vec!["alice", "shared"]);
        assert!(page.next_marker.is_none());
    }
}
