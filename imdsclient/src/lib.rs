/*!
`imdsclient` provides high-level methods to interact with the AWS Instance Metadata Service (IMDS).

The library uses IMDSv2 (session-oriented) requests over a pinned schema to guarantee compatibility.
A session token is fetched lazily on the first request, so constructing a client causes no network
traffic. If a request receives a `401` response the token is refreshed once and the request is sent
again; requests are otherwise single-shot.

The helpers are narrowed to the identity metadata needed to manage addresses on a running instance.
`fetch_instance_id` and `fetch_region` return `Ok(None)` when IMDS answers 404 for the target, so
callers can distinguish "no such item" from a transport failure.
*/

#![deny(rust_2018_idioms)]

use http::StatusCode;
use log::{debug, info, trace};
use reqwest::Client;
use serde_json::Value;
use snafu::{ensure, ResultExt};

const BASE_URI: &str = "http://169.254.169.254";
const PINNED_SCHEMA: &str = "2021-01-03";

// Session tokens can only be fetched from `latest`
const SESSION_TARGET: &str = "latest/api/token";
const SESSION_TOKEN_TTL_SECS: &str = "60";

/// A client for making IMDSv2 queries.
/// A session token is obtained on first use and reused between requests.
pub struct ImdsClient {
    client: Client,
    imds_base_uri: String,
    session_token: Option<String>,
}

impl Default for ImdsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ImdsClient {
    pub fn new() -> Self {
        Self::new_impl(BASE_URI.to_string())
    }

    fn new_impl(imds_base_uri: String) -> Self {
        Self {
            client: Client::new(),
            imds_base_uri,
            session_token: None,
        }
    }

    /// Gets the instance ID of the running instance from instance metadata.
    pub async fn fetch_instance_id(&mut self) -> Result<Option<String>> {
        let instance_id_target = "meta-data/instance-id";
        self.fetch_string(&instance_id_target).await
    }

    /// Returns the region described in the instance identity document.
    pub async fn fetch_region(&mut self) -> Result<Option<String>> {
        let target = "dynamic/instance-identity/document";
        let response = match self.fetch_bytes(target).await? {
            Some(response) => response,
            None => return Ok(None),
        };
        let identity_document: Value =
            serde_json::from_slice(&response).context(error::SerdeSnafu)?;
        let region = identity_document
            .get("region")
            .and_then(|value| value.as_str())
            .map(|region| region.to_string());
        Ok(region)
    }

    /// Helper to fetch bytes from IMDS using the pinned schema version.
    async fn fetch_bytes<S>(&mut self, end_target: S) -> Result<Option<Vec<u8>>>
    where
        S: AsRef<str>,
    {
        self.fetch_imds(PINNED_SCHEMA, end_target.as_ref()).await
    }

    /// Helper to fetch a string from IMDS using the pinned schema version.
    async fn fetch_string<S>(&mut self, end_target: S) -> Result<Option<String>>
    where
        S: AsRef<str>,
    {
        match self.fetch_imds(PINNED_SCHEMA, end_target).await? {
            Some(response_body) => Ok(Some(
                String::from_utf8(response_body).context(error::NonUtf8ResponseSnafu)?,
            )),
            None => Ok(None),
        }
    }

    /// Fetch data from IMDS. The request is sent once, allowing a single token refresh if the
    /// session token turns out to be expired or invalid.
    async fn fetch_imds<S1, S2>(&mut self, schema_version: S1, target: S2) -> Result<Option<Vec<u8>>>
    where
        S1: AsRef<str>,
        S2: AsRef<str>,
    {
        let uri = format!(
            "{}/{}/{}",
            self.imds_base_uri,
            schema_version.as_ref(),
            target.as_ref()
        );
        debug!("Requesting {}", &uri);
        let mut refreshed_token = false;
        loop {
            let session_token = self.session_token().await?;
            let response = self
                .client
                .get(&uri)
                .header("X-aws-ec2-metadata-token", &session_token)
                .send()
                .await
                .context(error::RequestSnafu {
                    method: "GET",
                    uri: &uri,
                })?;
            trace!("IMDS response: {:?}", &response);

            match response.status() {
                code @ StatusCode::OK => {
                    info!("Received {}", target.as_ref());
                    let response_body = response
                        .bytes()
                        .await
                        .context(error::ResponseBodySnafu {
                            method: "GET",
                            uri: &uri,
                            code,
                        })?
                        .to_vec();

                    trace!("Response: {:?}", printable_string(&response_body));

                    return Ok(Some(response_body));
                }

                // IMDS returns 404 if the target doesn't exist, or if IMDS is disabled
                StatusCode::NOT_FOUND => return Ok(None),

                // IMDS returns 401 if the session token is expired or invalid
                StatusCode::UNAUTHORIZED if !refreshed_token => {
                    info!("Session token is invalid or expired");
                    self.session_token = None;
                    refreshed_token = true;
                    continue;
                }

                code => {
                    let response_body = response
                        .bytes()
                        .await
                        .context(error::ResponseBodySnafu {
                            method: "GET",
                            uri: &uri,
                            code,
                        })?
                        .to_vec();

                    let response_str = printable_string(&response_body);
                    trace!("Response: {:?}", response_str);

                    return error::ResponseSnafu {
                        method: "GET",
                        uri: &uri,
                        code,
                        response_body: response_str,
                    }
                    .fail();
                }
            }
        }
    }

    /// Returns the current session token, fetching a new one if there is none.
    async fn session_token(&mut self) -> Result<String> {
        match &self.session_token {
            Some(session_token) => Ok(session_token.clone()),
            None => {
                let session_token = fetch_token(&self.client, &self.imds_base_uri).await?;
                self.session_token = Some(session_token.clone());
                Ok(session_token)
            }
        }
    }
}

/// Converts `bytes` to a `String` if it is a UTF-8 encoded string.
/// Truncates the string if it is too long for printing.
fn printable_string(bytes: &[u8]) -> String {
    if let Ok(s) = String::from_utf8(bytes.into()) {
        if s.len() < 2048 {
            s
        } else {
            format!("{}<truncated...>", &s[0..2034])
        }
    } else {
        "<binary>".to_string()
    }
}

/// Fetches a fresh IMDSv2 session token.
async fn fetch_token(client: &Client, imds_base_uri: &str) -> Result<String> {
    let uri = format!("{}/{}", imds_base_uri, SESSION_TARGET);
    debug!("Requesting session token from {}", &uri);
    let response = client
        .put(&uri)
        .header("X-aws-ec2-metadata-token-ttl-seconds", SESSION_TOKEN_TTL_SECS)
        .send()
        .await
        .context(error::RequestSnafu {
            method: "PUT",
            uri: &uri,
        })?;

    let code = response.status();
    ensure!(code == StatusCode::OK, error::TokenSnafu { uri: &uri, code });
    response.text().await.context(error::ResponseBodySnafu {
        method: "PUT",
        uri: &uri,
        code,
    })
}

mod error {
    use http::StatusCode;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Response was not UTF-8: {}", source))]
        NonUtf8Response { source: std::string::FromUtf8Error },

        #[snafu(display("Error {}ing '{}': {}", method, uri, source))]
        Request {
            method: String,
            uri: String,
            source: reqwest::Error,
        },

        #[snafu(display("Error {} when {}ing '{}': {}", code, method, uri, response_body))]
        Response {
            method: String,
            uri: String,
            code: StatusCode,
            response_body: String,
        },

        #[snafu(display(
            "Unable to read response body when {}ing '{}' (code {}) - {}",
            method,
            uri,
            code,
            source
        ))]
        ResponseBody {
            method: String,
            uri: String,
            code: StatusCode,
            source: reqwest::Error,
        },

        #[snafu(display("Deserialization error: {}", source))]
        Serde { source: serde_json::Error },

        #[snafu(display("Failed to fetch IMDSv2 session token from '{}' (code {})", uri, code))]
        Token { uri: String, code: StatusCode },
    }
}

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};

    #[tokio::test]
    async fn fetch_instance_id() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        let token = "some+token";
        let instance_id = "i-1234567890abcdef0";
        server.expect(
            Expectation::matching(request::method_path("PUT", "/latest/api/token"))
                .times(1)
                .respond_with(
                    status_code(200)
                        .append_header("X-aws-ec2-metadata-token-ttl-seconds", "60")
                        .body(token),
                ),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                format!("/{}/meta-data/instance-id", PINNED_SCHEMA),
            ))
            .times(1)
            .respond_with(
                status_code(200)
                    .append_header("X-aws-ec2-metadata-token", token)
                    .body(instance_id),
            ),
        );
        let mut imds_client = ImdsClient::new_impl(base_uri);
        let imds_data = imds_client.fetch_instance_id().await.unwrap();
        assert_eq!(imds_data, Some(instance_id.to_string()));
    }

    #[tokio::test]
    async fn fetch_instance_id_notfound() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        let token = "some+token";
        server.expect(
            Expectation::matching(request::method_path("PUT", "/latest/api/token"))
                .times(1)
                .respond_with(
                    status_code(200)
                        .append_header("X-aws-ec2-metadata-token-ttl-seconds", "60")
                        .body(token),
                ),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                format!("/{}/meta-data/instance-id", PINNED_SCHEMA),
            ))
            .times(1)
            .respond_with(status_code(404).append_header("X-aws-ec2-metadata-token", token)),
        );
        let mut imds_client = ImdsClient::new_impl(base_uri);
        let imds_data = imds_client.fetch_instance_id().await.unwrap();
        assert_eq!(imds_data, None);
    }

    #[tokio::test]
    async fn fetch_imds_refreshes_token_once_on_unauthorized() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        let token = "some+token";
        let instance_id = "i-1234567890abcdef0";
        server.expect(
            Expectation::matching(request::method_path("PUT", "/latest/api/token"))
                .times(2)
                .respond_with(
                    status_code(200)
                        .append_header("X-aws-ec2-metadata-token-ttl-seconds", "60")
                        .body(token),
                ),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                format!("/{}/meta-data/instance-id", PINNED_SCHEMA),
            ))
            .times(2)
            .respond_with(httptest::cycle![
                status_code(401),
                status_code(200)
                    .append_header("X-aws-ec2-metadata-token", token)
                    .body(instance_id),
            ]),
        );
        let mut imds_client = ImdsClient::new_impl(base_uri);
        let imds_data = imds_client.fetch_instance_id().await.unwrap();
        assert_eq!(imds_data, Some(instance_id.to_string()));
    }

    #[tokio::test]
    async fn fetch_imds_fails_when_unauthorized_persists() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        let token = "some+token";
        server.expect(
            Expectation::matching(request::method_path("PUT", "/latest/api/token"))
                .times(2)
                .respond_with(
                    status_code(200)
                        .append_header("X-aws-ec2-metadata-token-ttl-seconds", "60")
                        .body(token),
                ),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                format!("/{}/meta-data/instance-id", PINNED_SCHEMA),
            ))
            .times(2)
            .respond_with(status_code(401).append_header("X-aws-ec2-metadata-token", token)),
        );
        let mut imds_client = ImdsClient::new_impl(base_uri);
        assert!(imds_client.fetch_instance_id().await.is_err());
    }

    #[tokio::test]
    async fn fetch_imds_error_status_is_fatal() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        let token = "some+token";
        server.expect(
            Expectation::matching(request::method_path("PUT", "/latest/api/token"))
                .times(1)
                .respond_with(
                    status_code(200)
                        .append_header("X-aws-ec2-metadata-token-ttl-seconds", "60")
                        .body(token),
                ),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                format!("/{}/meta-data/instance-id", PINNED_SCHEMA),
            ))
            .times(1)
            .respond_with(status_code(503).append_header("X-aws-ec2-metadata-token", token)),
        );
        let mut imds_client = ImdsClient::new_impl(base_uri);
        assert!(imds_client.fetch_instance_id().await.is_err());
    }

    #[tokio::test]
    async fn fetch_token_failure_is_fatal() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        server.expect(
            Expectation::matching(request::method_path("PUT", "/latest/api/token"))
                .times(1)
                .respond_with(status_code(403)),
        );
        let mut imds_client = ImdsClient::new_impl(base_uri);
        assert!(imds_client.fetch_instance_id().await.is_err());
    }

    #[tokio::test]
    async fn fetch_region() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        let token = "some+token";
        let response_body = r#"{"region" : "us-west-2"}"#;
        server.expect(
            Expectation::matching(request::method_path("PUT", "/latest/api/token"))
                .times(1)
                .respond_with(
                    status_code(200)
                        .append_header("X-aws-ec2-metadata-token-ttl-seconds", "60")
                        .body(token),
                ),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                format!("/{}/dynamic/instance-identity/document", PINNED_SCHEMA),
            ))
            .times(1)
            .respond_with(
                status_code(200)
                    .append_header("X-aws-ec2-metadata-token", token)
                    .body(response_body),
            ),
        );
        let mut imds_client = ImdsClient::new_impl(base_uri);
        let imds_data = imds_client.fetch_region().await.unwrap();
        assert_eq!(imds_data, Some("us-west-2".to_string()));
    }

    #[tokio::test]
    async fn fetch_region_missing_from_document() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        let token = "some+token";
        let response_body = r#"{"accountId" : "0123456789012"}"#;
        server.expect(
            Expectation::matching(request::method_path("PUT", "/latest/api/token"))
                .times(1)
                .respond_with(
                    status_code(200)
                        .append_header("X-aws-ec2-metadata-token-ttl-seconds", "60")
                        .body(token),
                ),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                format!("/{}/dynamic/instance-identity/document", PINNED_SCHEMA),
            ))
            .times(1)
            .respond_with(
                status_code(200)
                    .append_header("X-aws-ec2-metadata-token", token)
                    .body(response_body),
            ),
        );
        let mut imds_client = ImdsClient::new_impl(base_uri);
        let imds_data = imds_client.fetch_region().await.unwrap();
        assert_eq!(imds_data, None);
    }

    #[test]
    fn printable_string_short() {
        let input = "Hello".as_bytes();
        let expected = "Hello".to_string();
        let actual = printable_string(input);
        assert_eq!(expected, actual);
    }

    #[test]
    fn printable_string_binary() {
        let input: [u8; 5] = [0, 254, 1, 0, 4];
        let expected = "<binary>".to_string();
        let actual = printable_string(&input);
        assert_eq!(expected, actual);
    }

    #[test]
    fn printable_string_truncated() {
        let mut input = String::new();
        for _ in 0..2048 {
            input.push('.');
        }
        let mut expected = String::new();
        for _ in 0..2034 {
            expected.push('.');
        }
        expected.push_str("<truncated...>");
        let actual = printable_string(input.as_bytes());
        assert_eq!(expected, actual);
    }
}
