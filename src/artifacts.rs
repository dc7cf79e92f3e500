//! Loading of kernel and model artifacts from the binary, disk or HTTP.

use crate::errors::{HarnessError, HarnessResult};
use crate::gpu::shaders::{self, ComposedKernel, TileSize};
use log::debug;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Where an artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArtifactSource {
    /// Compiled into the binary or generated in memory for the workload.
    #[default]
    Embedded,
    File {
        path: PathBuf,
    },
    Http {
        url: String,
    },
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactSource::Embedded => write!(f, "embedded"),
            ArtifactSource::File { path } => write!(f, "{}", path.display()),
            ArtifactSource::Http { url } => write!(f, "{}", url),
        }
    }
}

/// Why an external artifact could not be retrieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The server answered with a non-success status.
    Status(u16),
    /// The request or the read never produced a response.
    Transport(String),
}

impl FetchFailure {
    /// Converts into the error reported for a model artifact.
    pub fn into_model_error(self, source: &ArtifactSource) -> HarnessError {
        match self {
            FetchFailure::Status(status) => HarnessError::ModelFetchError {
                location: source.to_string(),
                status,
            },
            FetchFailure::Transport(message) => HarnessError::ArtifactError {
                location: source.to_string(),
                message,
            },
        }
    }

    /// Converts into the error reported for any other artifact.
    pub fn into_artifact_error(self, source: &ArtifactSource) -> HarnessError {
        let message = match self {
            FetchFailure::Status(status) => format!("HTTP status {}", status),
            FetchFailure::Transport(message) => message,
        };
        HarnessError::ArtifactError {
            location: source.to_string(),
            message,
        }
    }
}

/// Reads the raw bytes of a file or HTTP artifact.
///
/// Returns `Ok(None)` for [`ArtifactSource::Embedded`]; the caller supplies
/// the embedded content itself.
pub fn fetch_bytes(source: &ArtifactSource) -> Result<Option<Vec<u8>>, FetchFailure> {
    match source {
        ArtifactSource::Embedded => Ok(None),
        ArtifactSource::File { path } => std::fs::read(path)
            .map(Some)
            .map_err(|e| FetchFailure::Transport(e.to_string())),
        ArtifactSource::Http { url } => fetch_http(url).map(Some),
    }
}

/// Reads a UTF-8 text artifact.
pub fn fetch_text(source: &ArtifactSource) -> HarnessResult<Option<String>> {
    let Some(bytes) = fetch_bytes(source).map_err(|e| e.into_artifact_error(source))? else {
        return Ok(None);
    };
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|e| HarnessError::ArtifactError {
            location: source.to_string(),
            message: format!("not valid UTF-8: {}", e),
        })
}

/// Loads the GEMM kernel and applies `tile`. Embedded means the compiled-in
/// tiled kernel.
pub fn load_kernel_source(source: &ArtifactSource, tile: TileSize) -> HarnessResult<ComposedKernel> {
    let composed = match fetch_text(source)? {
        Some(text) => shaders::inject_tile_size(&text, tile),
        None => shaders::inject_tile_size(shaders::GEMM_TEMPLATE, tile),
    };
    Ok(composed)
}

fn fetch_http(url: &str) -> Result<Vec<u8>, FetchFailure> {
    let client = Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| FetchFailure::Transport(format!("build client: {}", e)))?;
    fetch_http_with(&client, url)
}

fn fetch_http_with(client: &Client, url: &str) -> Result<Vec<u8>, FetchFailure> {
    debug!("GET {}", url);
    let response = client
        .get(url)
        .header(USER_AGENT, concat!("gemm-bench/", env!("CARGO_PKG_VERSION")))
        .send()
        .map_err(|e| FetchFailure::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchFailure::Status(status.as_u16()));
    }

    response
        .bytes()
        .map(|bytes| bytes.to_vec())
        .map_err(|e| FetchFailure::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Answers one request per canned `(status line, body)` on a loopback port.
    fn serve(responses: Vec<(&'static str, &'static [u8])>) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/bench/gemm/model.onnx", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                    line.clear();
                }
                write!(
                    stream,
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                )
                .unwrap();
                stream.write_all(body).unwrap();
            }
        });
        (url, handle)
    }

    fn loopback_client() -> Client {
        Client::builder().no_proxy().timeout(FETCH_TIMEOUT).build().unwrap()
    }

    #[test]
    fn test_http_status_and_body() {
        let (url, server) = serve(vec![
            ("404 Not Found", &b"missing"[..]),
            ("200 OK", &b"\x08\x07model"[..]),
        ]);
        let client = loopback_client();

        let failure = fetch_http_with(&client, &url).unwrap_err();
        assert_eq!(failure, FetchFailure::Status(404));
        let source = ArtifactSource::Http { url: url.clone() };
        assert!(matches!(
            failure.into_model_error(&source),
            HarnessError::ModelFetchError { status: 404, ref location } if *location == url
        ));

        assert_eq!(fetch_http_with(&client, &url).unwrap(), b"\x08\x07model".to_vec());
        server.join().unwrap();
    }

    #[test]
    fn test_unreachable_host_is_transport_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/gemm.onnx", listener.local_addr().unwrap());
        drop(listener);

        let failure = fetch_http_with(&loopback_client(), &url).unwrap_err();
        assert!(matches!(failure, FetchFailure::Transport(_)));
    }

    #[test]
    fn test_embedded_yields_no_bytes() {
        assert_eq!(fetch_bytes(&ArtifactSource::Embedded), Ok(None));
    }

    #[test]
    fn test_file_source_reads_contents() {
        let path = std::env::temp_dir().join(format!("gemm_bench_artifact_{}.wgsl", std::process::id()));
        std::fs::write(&path, "fn main() {}").unwrap();

        let text = fetch_text(&ArtifactSource::File { path: path.clone() }).unwrap();
        assert_eq!(text.as_deref(), Some("fn main() {}"));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_embedded_kernel_has_tile_injected() {
        let kernel = load_kernel_source(&ArtifactSource::Embedded, TileSize::DEFAULT).unwrap();
        assert!(kernel.tile_injected);
        assert!(kernel.source.contains("const TILE_SIZE: u32 = 16u;"));
    }

    #[test]
    fn test_missing_file_is_transport_failure() {
        let source = ArtifactSource::File {
            path: PathBuf::from("/definitely/not/here/model.onnx"),
        };
        let failure = fetch_bytes(&source).unwrap_err();
        assert!(matches!(failure, FetchFailure::Transport(_)));
        assert!(matches!(
            failure.into_model_error(&source),
            HarnessError::ArtifactError { .. }
        ));
    }

    #[test]
    fn test_status_failure_maps_to_model_fetch_error() {
        let source = ArtifactSource::Http {
            url: "http://localhost/bench/gemm/model.onnx".to_string(),
        };
        let error = FetchFailure::Status(404).into_model_error(&source);
        assert!(matches!(
            error,
            HarnessError::ModelFetchError { status: 404, .. }
        ));
    }

    #[test]
    fn test_source_deserializes_from_tagged_json() {
        let source: ArtifactSource =
            serde_json::from_str(r#"{"kind": "http", "url": "http://example.com/gemm.wgsl"}"#)
                .unwrap();
        assert_eq!(
            source,
            ArtifactSource::Http {
                url: "http://example.com/gemm.wgsl".to_string()
            }
        );
    }
}
