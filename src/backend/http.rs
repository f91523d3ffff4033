//! Shared plumbing for the REST-backed clients.

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

pub(crate) fn client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("vaultplate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))
}

/// Send `request` bounded by whatever is left of `deadline`.
pub(crate) fn send(request: RequestBuilder, deadline: &Deadline) -> Result<Response> {
    let timeout = deadline.remaining()?;
    request.timeout(timeout).send().map_err(|e| {
        if e.is_timeout() {
            Error::DeadlineExceeded {
                operation: deadline.operation(),
            }
        } else {
            Error::from(e)
        }
    })
}

/// Map non-success statuses onto the error taxonomy. `not_found` builds the
/// error for a 404 so callers can name what was missing.
pub(crate) fn check(
    backend: &str,
    response: Response,
    not_found: impl FnOnce() -> Error,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => not_found(),
        StatusCode::UNAUTHORIZED => Error::auth(backend, format!("{status}: {body}")),
        _ => Error::Service {
            status: status.as_u16(),
            message: body,
        },
    })
}

pub(crate) fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.text()?;
    Ok(serde_json::from_str(&body)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    /// Serve one canned JSON response on a local port and return its base
    /// URL. The request is read in full and dropped.
    pub(crate) fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut length = 0;
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        length = value.trim().parse().unwrap();
                    }
                }
                line.clear();
            }
            let mut request_body = vec![0; length];
            reader.read_exact(&mut request_body).unwrap();
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
        });
        format!("http://{addr}")
    }

    fn get(url: &str) -> Result<Response> {
        let deadline = Deadline::after("test", Duration::from_secs(5));
        let response = send(client()?.get(url), &deadline)?;
        check("test", response, || Error::not_found(url, "db", ""))
    }

    #[derive(Debug, Deserialize)]
    struct Value {
        value: String,
    }

    #[test]
    fn success_is_decoded() {
        let url = serve_once("200 OK", r#"{"value":"pw"}"#);
        let decoded: Value = decode(get(&url).unwrap()).unwrap();
        assert_eq!(decoded.value, "pw");
    }

    #[test]
    fn not_found_uses_the_callers_error() {
        let url = serve_once("404 Not Found", "{}");
        let err = get(&url).unwrap_err();
        assert!(matches!(err, Error::NotFound { ref secret, .. } if secret == "db"));
    }

    #[test]
    fn unauthorized_is_an_auth_error() {
        let url = serve_once("401 Unauthorized", r#"{"errors":["permission denied"]}"#);
        let err = get(&url).unwrap_err();
        assert!(
            matches!(err, Error::Auth { ref message, .. } if message.contains("permission denied"))
        );
    }

    #[test]
    fn other_statuses_are_service_errors() {
        for status in ["403 Forbidden", "500 Internal Server Error"] {
            let url = serve_once(status, "boom");
            let err = get(&url).unwrap_err();
            assert!(matches!(err, Error::Service { ref message, .. } if message == "boom"));
        }
    }

    #[test]
    fn undecodable_body_is_a_decode_error() {
        let url = serve_once("200 OK", "not json");
        let err = decode::<Value>(get(&url).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn expired_deadline_sends_nothing() {
        let deadline = Deadline::after("lookup", Duration::ZERO);
        let err = send(client().unwrap().get("http://127.0.0.1:9"), &deadline).unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { operation: "lookup" }));
    }
}
