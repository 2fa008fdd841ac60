//! Mapping of Google Storage artifacts to caching proxy URLs.
//!
//! The device never talks to Google Storage directly. It downloads from a
//! caching proxy which exposes three endpoints: a raw download, extraction of
//! a single member out of a tarball, and decompression of an archive.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CACHE_DOWNLOAD_URI: &str = "/download/";
const CACHE_UNTAR_AND_DOWNLOAD_URI: &str = "/extract/";
const CACHE_EXTRACT_AND_DOWNLOAD_URI: &str = "/decompress/";

/// Resumable, retried download on the device side.
const CURL_DOWNLOAD: &str = "curl -S -s -v -# -C - --retry 3 --retry-delay 60";

/// Artifact to fetch through the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Download the object as is.
    GsFile(String),
    /// Download a single member of a tarball.
    GsTarFile { path: String, file: String },
    /// Download a decompressed archive.
    GsZipFile(String),
}

/// Where a cached artifact goes on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDestination {
    File(String),
    /// Shell commands the download is piped into.
    Pipe(String),
}

/// Extracts `bucket/object` from a `gs://bucket/object` URL.
pub fn parse_gs_url(gs_url: &str) -> Result<String> {
    let rest = gs_url.strip_prefix("gs://").ok_or_else(|| {
        Error::InvalidSource(format!(
            "gs url must begin with 'gs://', instead have, {}",
            gs_url
        ))
    })?;

    let mut parts = rest.split('/').filter(|s| !s.is_empty() && *s != ".");
    let bucket = parts
        .next()
        .ok_or_else(|| Error::InvalidSource(format!("missing bucket in {}", gs_url)))?;

    Ok(std::iter::once(bucket)
        .chain(parts)
        .collect::<Vec<_>>()
        .join("/"))
}

/// Builds the caching proxy URL for `source`.
///
/// The source is validated before the address is looked at, so a malformed
/// source is always reported as such.
pub fn cache_url(cache_address: &str, source: &CacheSource) -> Result<String> {
    let relative = match source {
        CacheSource::GsFile(path) => format!("{}{}", CACHE_DOWNLOAD_URI, parse_gs_url(path)?),
        CacheSource::GsTarFile { path, file } => format!(
            "{}{}?file={}",
            CACHE_UNTAR_AND_DOWNLOAD_URI,
            parse_gs_url(path)?,
            file
        ),
        CacheSource::GsZipFile(path) => {
            format!("{}{}", CACHE_EXTRACT_AND_DOWNLOAD_URI, parse_gs_url(path)?)
        }
    };

    if cache_address.is_empty() {
        return Err(Error::Config("cache_address is not configured".to_string()));
    }

    Ok(format!("{}{}", cache_address.trim_end_matches('/'), relative))
}

/// Device-side command downloading `url` into `destination`.
pub fn download_command(url: &str, destination: &CacheDestination) -> String {
    match destination {
        CacheDestination::File(path) => format!("{} -o {} {}", CURL_DOWNLOAD, path, url),
        CacheDestination::Pipe(commands) => format!("{} {} | {}", CURL_DOWNLOAD, url, commands),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CACHE: &str = "http://10.0.0.1:8082";

    #[test]
    fn test_raw_download_url() {
        let url = cache_url(CACHE, &CacheSource::GsFile("gs://bucket/obj".to_string())).unwrap();
        assert_eq!(url, "http://10.0.0.1:8082/download/bucket/obj");
    }

    #[test]
    fn test_tar_member_url() {
        let source = CacheSource::GsTarFile {
            path: "gs://bucket/obj".to_string(),
            file: "m".to_string(),
        };
        let url = cache_url("http://10.0.0.1:8082/", &source).unwrap();
        assert_eq!(url, "http://10.0.0.1:8082/extract/bucket/obj?file=m");
    }

    #[test]
    fn test_decompress_url() {
        let source = CacheSource::GsZipFile("gs://chromeos-image-archive/eve-release/R100/image.zip".to_string());
        let url = cache_url(CACHE, &source).unwrap();
        assert_eq!(
            url,
            "http://10.0.0.1:8082/decompress/chromeos-image-archive/eve-release/R100/image.zip"
        );
    }

    #[test]
    fn test_non_gs_source_rejected_before_address_check() {
        let err = cache_url("", &CacheSource::GsFile("http://bucket/obj".to_string())).unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }

    #[test]
    fn test_parse_gs_url_cleans_path() {
        assert_eq!(parse_gs_url("gs://bucket//a/./b/").unwrap(), "bucket/a/b");
        assert!(parse_gs_url("gs://").is_err());
    }

    #[test]
    fn test_download_command() {
        let file = download_command("http://c/download/b/o", &CacheDestination::File("/tmp/o".to_string()));
        assert_eq!(
            file,
            "curl -S -s -v -# -C - --retry 3 --retry-delay 60 -o /tmp/o http://c/download/b/o"
        );
        let pipe = download_command("http://c/download/b/o", &CacheDestination::Pipe("tar xf -".to_string()));
        assert!(pipe.ends_with("http://c/download/b/o | tar xf -"));
    }
}
