// RPC client: a small blocking HTTP client that talks to the skiffdata
// platform API. Every remote operation is one POST of a JSON parameter
// object to `<server>/<method>`; the response body is the result value or
// an `{"error": ...}` envelope.

use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::multipart;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::{CredentialStore, Credentials};
use crate::config;
use crate::error::{ClientError, Result};

/// Client for one server. Holds a reqwest blocking client, the server URL
/// and the credentials saved for that server's host, if any.
#[derive(Clone)]
pub struct Client {
    http: reqwest::blocking::Client,
    server_url: String,
    credentials: Option<Credentials>,
}

impl Client {
    /// A client for `server_url`, picking up saved credentials for that
    /// host from the credential store.
    pub fn new(server_url: impl Into<String>) -> Result<Client> {
        let server_url = server_url.into();
        let host = config::host_name(&server_url)?;
        let credentials = CredentialStore::open_default()?.load(&host)?;
        Ok(Client {
            http: reqwest::blocking::Client::new(),
            server_url,
            credentials,
        })
    }

    /// A client for the configured server (`SKIFF_SERVER_URL` or the
    /// default).
    pub fn from_env() -> Result<Client> {
        Client::new(config::server_url())
    }

    /// A client with explicit credentials, bypassing the credential store.
    pub fn with_credentials(
        server_url: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Client {
        Client {
            http: reqwest::blocking::Client::new(),
            server_url: server_url.into(),
            credentials,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Performs one RPC call and returns the JSON result value.
    pub fn call(&self, method: &str, params: Value) -> Result<Value> {
        debug!(method, "rpc call");
        let response = self
            .request(method)
            .json(&params)
            .send()
            .map_err(ClientError::Transport)?;
        read_response(response)
    }

    /// Like [`call`](Client::call), but sends the parameters together with
    /// one file as a multipart form. Used for uploads (`deploy`,
    /// `put_file`) where the payload does not fit in a JSON body.
    pub fn call_with_file(
        &self,
        method: &str,
        params: &Value,
        field: &str,
        file: std::fs::File,
        file_name: &str,
    ) -> Result<Value> {
        debug!(method, field, file_name, "rpc call with file");
        let mut form = multipart::Form::new();
        if let Some(object) = params.as_object() {
            for (key, value) in object {
                form = form.text(key.clone(), plain_text(value));
            }
        }
        let part = multipart::Part::reader(file).file_name(file_name.to_string());
        form = form.part(field.to_string(), part);

        let response = self
            .request(method)
            .multipart(form)
            .send()
            .map_err(ClientError::Transport)?;
        read_response(response)
    }

    /// Performs an RPC call whose successful response is a raw byte
    /// stream rather than JSON. Used for downloads (`get_file`).
    pub fn call_for_file(&self, method: &str, params: Value) -> Result<impl Read> {
        debug!(method, "rpc call for file");
        let response = self
            .request(method)
            .json(&params)
            .send()
            .map_err(ClientError::Transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match read_response(response) {
            Ok(value) => Err(ClientError::Remote(format!(
                "server returned {status} with body {value}"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Authenticates against the server and returns the auth token.
    /// Persisting the token is the caller's decision.
    pub fn login(&self, email: &str, password: &str) -> Result<String> {
        let token = self.call("login", json!({ "email": email, "password": password }))?;
        token
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClientError::Remote(format!("unexpected login response: {token}")))
    }

    /// The identity the server associates with our credentials.
    pub fn whoami(&self) -> Result<String> {
        let user = self.call("whoami", json!({}))?;
        Ok(user
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| user.to_string()))
    }

    fn request(&self, method: &str) -> reqwest::blocking::RequestBuilder {
        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), method);
        let mut request = self.http.post(url);
        if let Some(header) = self.auth_header() {
            request = request.header(AUTHORIZATION, header);
        }
        request
    }

    fn auth_header(&self) -> Option<String> {
        let creds = self.credentials.as_ref()?;
        let both = format!("{}:{}", creds.login, creds.secret);
        Some(format!("Basic {}", BASE64.encode(both)))
    }
}

// Multipart form fields are plain strings; JSON strings go through
// unquoted, everything else in its JSON rendering.
fn plain_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// Reads a response body and classifies the outcome. A 403 is an
// authentication failure whatever the body looks like, so it must not
// depend on the body being valid JSON; for every other status a
// non-JSON body is itself a malformed response.
fn read_response(response: reqwest::blocking::Response) -> Result<Value> {
    let status = response.status();
    if status == StatusCode::FORBIDDEN {
        let body: Value = response.json().unwrap_or(Value::Null);
        return interpret_response(status, body);
    }
    let body: Value = response
        .json()
        .map_err(|e| ClientError::Remote(format!("invalid response from server: {e}")))?;
    interpret_response(status, body)
}

/// Classifies a (status, body) pair into the error taxonomy.
///
/// A 403 always means the credentials were rejected, whatever the body
/// says. Any `{"error": ...}` envelope is a server-reported failure, even
/// under a 2xx status. A bare non-2xx without an envelope is still a
/// remote failure, just a less descriptive one.
fn interpret_response(status: StatusCode, body: Value) -> Result<Value> {
    let error_message = body
        .get("error")
        .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()));

    if status == StatusCode::FORBIDDEN {
        return Err(ClientError::Authentication(
            error_message.unwrap_or_else(|| "access denied, please login again".into()),
        ));
    }
    if let Some(message) = error_message {
        return Err(ClientError::Remote(message));
    }
    if !status.is_success() {
        return Err(ClientError::Remote(format!("server returned {status}")));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn forbidden_is_an_authentication_error() {
        let err = interpret_response(StatusCode::FORBIDDEN, json!({"error": "Forbidden"}))
            .unwrap_err();
        assert!(matches!(err, ClientError::Authentication(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn forbidden_without_envelope_is_still_authentication() {
        let err = interpret_response(StatusCode::FORBIDDEN, json!(null)).unwrap_err();
        assert!(matches!(err, ClientError::Authentication(_)));
    }

    #[test]
    fn error_envelope_is_a_remote_error() {
        let err = interpret_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "Failed to build docker image"}),
        )
        .unwrap_err();
        match err {
            ClientError::Remote(message) => {
                assert_eq!(message, "Failed to build docker image")
            }
            other => panic!("expected a remote error, got {other:?}"),
        }
    }

    #[test]
    fn envelope_wins_even_on_2xx() {
        let err = interpret_response(StatusCode::OK, json!({"error": "X"})).unwrap_err();
        assert!(matches!(err, ClientError::Remote(m) if m == "X"));
    }

    #[test]
    fn success_body_passes_through() {
        let value = interpret_response(StatusCode::OK, json!(["a", "b"])).unwrap();
        assert_eq!(value, json!(["a", "b"]));
    }

    #[test]
    fn bare_failure_status_is_a_remote_error() {
        let err = interpret_response(StatusCode::BAD_GATEWAY, json!(null)).unwrap_err();
        assert!(matches!(err, ClientError::Remote(_)));
    }

    #[test]
    fn connection_refused_is_a_transport_error() {
        // Port 9 (discard) is not listening anywhere we run tests.
        let client = Client {
            http: reqwest::blocking::Client::new(),
            server_url: "http://127.0.0.1:9".into(),
            credentials: None,
        };
        let err = client.call("ping", json!({})).unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn auth_header_is_basic_base64() {
        let client = Client {
            http: reqwest::blocking::Client::new(),
            server_url: "http://localhost".into(),
            credentials: Some(Credentials {
                login: "user@test.com".into(),
                secret: "tok".into(),
            }),
        };
        let header = client.auth_header().unwrap();
        assert_eq!(
            header,
            format!("Basic {}", BASE64.encode("user@test.com:tok"))
        );
    }

    #[test]
    fn no_credentials_means_no_header() {
        let client = Client {
            http: reqwest::blocking::Client::new(),
            server_url: "http://localhost".into(),
            credentials: None,
        };
        assert!(client.auth_header().is_none());
    }
}
