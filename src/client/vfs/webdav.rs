use super::{VfsEntry, VfsProvider};
use crate::client::{Capabilities, ReadStream, WriteMode, WriteStream};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, StorageError};
use crate::utils::{file_name, normalize_path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderValue, CONTENT_TYPE, RANGE};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode};
use std::io;
use std::time::Duration;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;
use url::Url;

const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
  </d:prop>
</d:propfind>"#;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DavItem {
    pub href: String,
    pub is_collection: bool,
    pub content_length: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

pub struct WebDavProvider {
    http: Client,
    origin: Url,
    user: Option<String>,
    password: Option<String>,
    root: String,
}

impl WebDavProvider {
    pub fn new(descriptor: &ConnectionDescriptor, timeout: Duration) -> Result<Self> {
        let origin = Url::parse(&descriptor.file_uri("/"))
            .map_err(|e| StorageError::InvalidDescriptor(format!("bad WebDAV address: {e}")))?;
        let http = Client::builder()
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StorageError::ProtocolError(e.to_string()))?;
        let (user, password) = if descriptor.anonymous {
            (None, None)
        } else {
            (descriptor.user.clone(), descriptor.password.clone())
        };
        Ok(Self {
            http,
            origin,
            user,
            password,
            root: descriptor.root_folder(),
        })
    }

    fn url(&self, path: &str, collection: bool) -> String {
        let path = normalize_path(path);
        let mut encoded: String = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| format!("/{}", utf8_percent_encode(segment, SEGMENT)))
            .collect();
        if encoded.is_empty() || collection {
            encoded.push('/');
        }
        format!("{}://{}{}", self.origin.scheme(), authority(&self.origin), encoded)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.user {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        builder.send().await.map_err(|e| http_error(&e, self.origin.host_str().unwrap_or("")))
    }

    async fn propfind(&self, path: &str, depth: &str, collection: bool) -> Result<Response> {
        let url = self.url(path, collection);
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|e| StorageError::ProtocolError(e.to_string()))?;
        let builder = self
            .request(method, &url)
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        self.send(builder).await
    }

    async fn multistatus(&self, response: Response, subject: &str) -> Result<Vec<DavItem>> {
        let status = response.status();
        if status != StatusCode::MULTI_STATUS && !status.is_success() {
            return Err(status_error(status, subject));
        }
        let text = response
            .text()
            .await
            .map_err(|e| http_error(&e, subject))?;
        parse_multistatus(&text)
    }

    fn to_entry(&self, item: &DavItem) -> VfsEntry {
        VfsEntry {
            name: file_name(&href_to_path(&item.href)),
            is_dir: item.is_collection,
            size: if item.is_collection { None } else { item.content_length },
            modified: item.last_modified,
        }
    }
}

#[async_trait]
impl VfsProvider for WebDavProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            random_access_read: true,
            atomic_replace: true,
            append: false,
        }
    }

    async fn open(&mut self) -> Result<()> {
        let response = self.propfind(&self.root, "0", true).await?;
        let root = self.root.clone();
        self.multistatus(response, &root).await?;
        debug!(origin = %self.origin, "WebDAV endpoint reachable");
        Ok(())
    }

    async fn probe(&mut self) -> Result<()> {
        let url = self.url(&self.root, true);
        let response = self.send(self.request(Method::OPTIONS, &url)).await?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(StorageError::AuthenticationFailed),
            _ => Ok(()),
        }
    }

    async fn read_dir(&mut self, path: &str) -> Result<Vec<VfsEntry>> {
        let response = self.propfind(path, "1", true).await?;
        let items = self.multistatus(response, path).await?;
        let own = normalize_path(path);
        Ok(items
            .iter()
            .filter(|item| href_to_path(&item.href) != own)
            .map(|item| self.to_entry(item))
            .collect())
    }

    async fn metadata(&mut self, path: &str) -> Result<VfsEntry> {
        let mut response = self.propfind(path, "0", path == "/").await?;
        if response.status().is_redirection() {
            response = self.propfind(path, "0", true).await?;
        }
        let items = self.multistatus(response, path).await?;
        let item = items
            .first()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let mut entry = self.to_entry(item);
        entry.name = file_name(path);
        Ok(entry)
    }

    async fn reader(&mut self, path: &str, offset: u64) -> Result<ReadStream> {
        let url = self.url(path, false);
        let mut builder = self.request(Method::GET, &url);
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }
        let response = self.send(builder).await?;
        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            return Ok(ReadStream::new(tokio::io::empty()));
        }
        if !status.is_success() {
            return Err(status_error(status, path));
        }
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Err(StorageError::ProtocolError(format!(
                "server ignored the range request for {path}"
            )));
        }
        let body = response.bytes_stream().map_err(io::Error::other);
        Ok(ReadStream::new(StreamReader::new(body)))
    }

    async fn writer(&mut self, path: &str, mode: WriteMode) -> Result<WriteStream> {
        if mode == WriteMode::Append {
            return Err(StorageError::ProtocolError(
                "WebDAV does not support append writes".into(),
            ));
        }
        let builder = self.request(Method::PUT, &self.url(path, false));
        let subject = path.to_string();
        let host = self.origin.host_str().unwrap_or_default().to_string();

        Ok(WriteStream::spawn(move |source| async move {
            let body = Body::wrap_stream(ReaderStream::new(source));
            let response = builder
                .body(body)
                .send()
                .await
                .map_err(|e| http_error(&e, &host))?;
            match response.status() {
                status if status.is_success() => Ok(()),
                status => Err(status_error(status, &subject)),
            }
        }))
    }

    async fn make_dir(&mut self, path: &str) -> Result<()> {
        let method = Method::from_bytes(b"MKCOL")
            .map_err(|e| StorageError::ProtocolError(e.to_string()))?;
        let response = self.send(self.request(method, &self.url(path, true))).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Err(StorageError::AlreadyExists(path.to_string())),
            status => Err(status_error(status, path)),
        }
    }

    async fn make_file(&mut self, path: &str) -> Result<()> {
        let builder = self
            .request(Method::PUT, &self.url(path, false))
            .header("If-None-Match", HeaderValue::from_static("*"))
            .body(Vec::new());
        let response = self.send(builder).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(status_error(status, path)),
        }
    }

    async fn remove(&mut self, path: &str, is_dir: bool) -> Result<()> {
        let response = self.send(self.request(Method::DELETE, &self.url(path, is_dir))).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(status_error(status, path)),
        }
    }

    async fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<()> {
        let method = Method::from_bytes(b"MOVE")
            .map_err(|e| StorageError::ProtocolError(e.to_string()))?;
        let builder = self
            .request(method, &self.url(from, false))
            .header("Destination", self.url(to, false))
            .header("Overwrite", if replace { "T" } else { "F" });
        let response = self.send(builder).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::PRECONDITION_FAILED => Err(StorageError::AlreadyExists(to.to_string())),
            status => Err(status_error(status, from)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

pub(crate) fn href_to_path(href: &str) -> String {
    let raw = match Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    normalize_path(&percent_decode_str(&raw).decode_utf8_lossy())
}

fn status_error(status: StatusCode, subject: &str) -> StorageError {
    match status {
        StatusCode::UNAUTHORIZED => StorageError::AuthenticationFailed,
        StatusCode::FORBIDDEN | StatusCode::LOCKED => StorageError::PermissionDenied(subject.to_string()),
        StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::GONE => {
            StorageError::NotFound(subject.to_string())
        }
        StatusCode::PRECONDITION_FAILED => StorageError::AlreadyExists(subject.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => StorageError::Timeout,
        StatusCode::INSUFFICIENT_STORAGE => StorageError::IoError(format!("{subject}: insufficient storage")),
        other => StorageError::ProtocolError(format!("{subject}: HTTP {other}")),
    }
}

fn http_error(err: &reqwest::Error, subject: &str) -> StorageError {
    if err.is_timeout() {
        return StorageError::Timeout;
    }
    if err.is_connect() {
        let detail = format!("{err:?}").to_lowercase();
        if detail.contains("dns") || detail.contains("lookup") || detail.contains("resolve") {
            return StorageError::NameResolutionFailed(subject.to_string());
        }
        return StorageError::HostUnreachable(subject.to_string());
    }
    if err.is_body() || err.is_request() {
        return StorageError::SessionExpired;
    }
    StorageError::ProtocolError(err.to_string())
}

fn local_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    match name.rfind(':') {
        Some(pos) => name[pos + 1..].to_string(),
        None => name.to_string(),
    }
}

pub(crate) fn parse_multistatus(xml: &str) -> Result<Vec<DavItem>> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<DavItem> = None;
    let mut current_tag: Option<String> = None;
    let mut in_resourcetype = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "response" => current = Some(DavItem::default()),
                    "resourcetype" => in_resourcetype = true,
                    "collection" if in_resourcetype => {
                        if let Some(item) = current.as_mut() {
                            item.is_collection = true;
                        }
                    }
                    "href" | "getcontentlength" | "getlastmodified" => current_tag = Some(local),
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                if in_resourcetype && local_name(e.name().as_ref()) == "collection" {
                    if let Some(item) = current.as_mut() {
                        item.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                if let (Some(tag), Some(item)) = (current_tag.as_deref(), current.as_mut()) {
                    let text = e.unescape().unwrap_or_default().trim().to_string();
                    match tag {
                        "href" => item.href = text,
                        "getcontentlength" => item.content_length = text.parse().ok(),
                        "getlastmodified" => {
                            item.last_modified = DateTime::parse_from_rfc2822(&text)
                                .ok()
                                .map(|dt| dt.with_timezone(&Utc));
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "response" => items.extend(current.take()),
                    "resourcetype" => in_resourcetype = false,
                    _ => {
                        if current_tag.as_deref() == Some(local.as_str()) {
                            current_tag = None;
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(StorageError::ProtocolError(format!("malformed multistatus: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(items)
}
