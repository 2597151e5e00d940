//! The HTTP API datasource instance.
//!
//! Performs the HTTP call described by a [`DataRequest`], applies the
//! configured authentication variant, verifies the configured success
//! condition, extracts the payload at `data_path`, and surfaces
//! pagination metadata.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use convey_db::models::{DataSource, DataSourceKind};

use crate::error::SyncError;

use super::{DataRequest, DataResponse, DatasourceInstance, OP_QUERY, ResponseMetadata};

/// Authentication variants for HTTP upstreams.
#[derive(Debug, Clone, Default)]
enum AuthConfig {
    #[default]
    None,
    Basic {
        username: String,
        password: Option<String>,
    },
    Bearer {
        token: String,
    },
    ApiKey {
        name: String,
        value: String,
        in_query: bool,
    },
    OAuth2(OAuthConfig),
    Custom {
        headers: Map<String, Value>,
    },
}

#[derive(Debug, Clone)]
struct OAuthConfig {
    token_url: String,
    grant_type: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    username: Option<String>,
    password: Option<String>,
    refresh_token: Option<String>,
    code: Option<String>,
    scope: Option<String>,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// How a response is judged successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuccessMode {
    Status,
    FieldValue,
    Both,
}

#[derive(Debug, Clone)]
struct SuccessCondition {
    mode: SuccessMode,
    status_min: u16,
    status_max: u16,
    success_field: Option<String>,
    success_value: Value,
    error_field: String,
}

impl Default for SuccessCondition {
    fn default() -> Self {
        Self {
            mode: SuccessMode::Status,
            status_min: 200,
            status_max: 299,
            success_field: None,
            success_value: Value::Null,
            error_field: "msg".to_owned(),
        }
    }
}

/// Transient HTTP instance: one reqwest client per datasource.
#[derive(Debug)]
pub struct HttpInstance {
    kind: DataSourceKind,
    client: reqwest::Client,
    base_url: String,
    default_headers: Map<String, Value>,
    auth: AuthConfig,
    success: SuccessCondition,
    data_path: Option<String>,
    total_field: Option<String>,
    page_field: Option<String>,
    size_field: Option<String>,
    token_cache: Mutex<Option<CachedToken>>,
}

/// Read a dotted path (`data.items`) out of a JSON value.
fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

impl HttpInstance {
    pub fn from_datasource(datasource: &DataSource) -> Result<Self, SyncError> {
        let cfg = &datasource.connection_config;
        let str_field = |v: &Value, key: &str| -> Option<String> {
            v.get(key).and_then(|s| s.as_str()).map(str::to_owned)
        };

        let base_url = str_field(cfg, "base_url")
            .ok_or_else(|| SyncError::Config("http datasource requires base_url".to_owned()))?;

        let timeout = cfg
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(30);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build http client: {e}")))?;

        let auth = match cfg.get("auth") {
            None => AuthConfig::None,
            Some(a) => match a.get("auth_type").and_then(|v| v.as_str()).unwrap_or("none") {
                "none" => AuthConfig::None,
                "basic" => AuthConfig::Basic {
                    username: str_field(a, "username").ok_or_else(|| {
                        SyncError::Config("basic auth requires username".to_owned())
                    })?,
                    password: str_field(a, "password"),
                },
                "bearer" => AuthConfig::Bearer {
                    token: str_field(a, "token").ok_or_else(|| {
                        SyncError::Config("bearer auth requires token".to_owned())
                    })?,
                },
                "api-key" => AuthConfig::ApiKey {
                    name: str_field(a, "key_name").unwrap_or_else(|| "X-Api-Key".to_owned()),
                    value: str_field(a, "key_value").ok_or_else(|| {
                        SyncError::Config("api-key auth requires key_value".to_owned())
                    })?,
                    in_query: a.get("key_location").and_then(|v| v.as_str()) == Some("query"),
                },
                "oauth2" => AuthConfig::OAuth2(OAuthConfig {
                    token_url: str_field(a, "token_url").ok_or_else(|| {
                        SyncError::Config("oauth2 auth requires token_url".to_owned())
                    })?,
                    grant_type: str_field(a, "grant_type")
                        .unwrap_or_else(|| "client_credentials".to_owned()),
                    client_id: str_field(a, "client_id"),
                    client_secret: str_field(a, "client_secret"),
                    username: str_field(a, "username"),
                    password: str_field(a, "password"),
                    refresh_token: str_field(a, "refresh_token"),
                    code: str_field(a, "code"),
                    scope: str_field(a, "scope"),
                }),
                "custom" => AuthConfig::Custom {
                    headers: a
                        .get("headers")
                        .and_then(|h| h.as_object())
                        .cloned()
                        .unwrap_or_default(),
                },
                other => {
                    return Err(SyncError::Config(format!(
                        "unknown auth type {other:?}"
                    )));
                }
            },
        };

        let success = match cfg.get("success_condition") {
            None => SuccessCondition::default(),
            Some(s) => {
                let defaults = SuccessCondition::default();
                let mode = match s.get("mode").and_then(|v| v.as_str()) {
                    Some("field_value") => SuccessMode::FieldValue,
                    Some("both") => SuccessMode::Both,
                    _ => SuccessMode::Status,
                };
                // `==` is a legacy spelling of `equals`; anything else is
                // unsupported.
                if let Some(op) = s.get("condition").and_then(|v| v.as_str()) {
                    if op != "equals" && op != "==" {
                        return Err(SyncError::Config(format!(
                            "unsupported success condition operator {op:?}"
                        )));
                    }
                }
                SuccessCondition {
                    mode,
                    status_min: s
                        .get("status_min")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as u16)
                        .unwrap_or(defaults.status_min),
                    status_max: s
                        .get("status_max")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as u16)
                        .unwrap_or(defaults.status_max),
                    success_field: str_field(s, "success_field"),
                    success_value: s.get("success_value").cloned().unwrap_or(Value::Null),
                    error_field: str_field(s, "error_field").unwrap_or(defaults.error_field),
                }
            }
        };

        Ok(Self {
            kind: datasource.kind,
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            default_headers: cfg
                .get("headers")
                .and_then(|h| h.as_object())
                .cloned()
                .unwrap_or_default(),
            auth,
            success,
            data_path: str_field(cfg, "data_path"),
            total_field: str_field(cfg, "total_field"),
            page_field: str_field(cfg, "page_field"),
            size_field: str_field(cfg, "size_field"),
            token_cache: Mutex::new(None),
        })
    }

    /// Fetch (or reuse) an OAuth2 access token.
    async fn oauth_token(&self, oauth: &OAuthConfig) -> Result<String, SyncError> {
        let mut cache = self.token_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let mut form: Vec<(&str, &str)> = vec![("grant_type", oauth.grant_type.as_str())];
        let pairs = [
            ("client_id", &oauth.client_id),
            ("client_secret", &oauth.client_secret),
            ("username", &oauth.username),
            ("password", &oauth.password),
            ("refresh_token", &oauth.refresh_token),
            ("code", &oauth.code),
            ("scope", &oauth.scope),
        ];
        for (key, value) in &pairs {
            if let Some(value) = value {
                form.push((key, value.as_str()));
            }
        }

        let response = self
            .client
            .post(&oauth.token_url)
            .form(&form)
            .send()
            .await
            .map_err(SyncError::from)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            SyncError::Protocol(format!("token endpoint returned non-JSON body: {e}"))
        })?;

        if !status.is_success() {
            return Err(SyncError::Protocol(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SyncError::Protocol("token response carries no access_token".to_owned())
            })?
            .to_owned();
        let expires_in = body.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(3600);

        // Refresh one minute early so in-flight requests never carry a
        // token that expires mid-call.
        *cache = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(60).max(30)),
        });

        Ok(access_token)
    }

    /// Judge the response and pull out the error text on refusal.
    fn evaluate_success(&self, status: u16, body: &Value) -> (bool, Option<String>) {
        let status_ok = status >= self.success.status_min && status <= self.success.status_max;

        let field_ok = || -> bool {
            match &self.success.success_field {
                None => true,
                Some(field) => value_at_path(body, field)
                    .map(|v| *v == self.success.success_value)
                    .unwrap_or(false),
            }
        };

        let ok = match self.success.mode {
            SuccessMode::Status => status_ok,
            SuccessMode::FieldValue => field_ok(),
            SuccessMode::Both => status_ok && field_ok(),
        };

        if ok {
            (true, None)
        } else {
            let error = value_at_path(body, &self.success.error_field)
                .and_then(|v| v.as_str())
                .map(str::to_owned)
                .unwrap_or_else(|| format!("upstream returned status {status}"));
            (false, Some(error))
        }
    }
}

#[async_trait]
impl DatasourceInstance for HttpInstance {
    fn kind(&self) -> DataSourceKind {
        self.kind
    }

    fn is_started(&self) -> bool {
        true
    }

    async fn start(&self, _cancel: &CancellationToken) -> Result<(), SyncError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &DataRequest,
    ) -> Result<DataResponse, SyncError> {
        if request.operation != OP_QUERY {
            return Err(SyncError::Config(format!(
                "http instance cannot handle operation {:?}",
                request.operation
            )));
        }

        let path = request.query.as_deref().unwrap_or("");
        let url = format!("{}{}", self.base_url, path);

        let method = request
            .params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET");
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| SyncError::Config(format!("invalid http method {method:?}")))?;

        let mut builder = self.client.request(method, &url);

        // Query parameters from the assembled request.
        let mut query_pairs: Vec<(String, String)> = Vec::new();
        if let Some(query) = request.params.get("query").and_then(|v| v.as_object()) {
            for (key, value) in query {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                query_pairs.push((key.clone(), rendered));
            }
        }

        // Headers: datasource defaults, then per-request overrides.
        for headers in [
            Some(&self.default_headers),
            request.params.get("headers").and_then(|v| v.as_object()),
        ]
        .into_iter()
        .flatten()
        {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    builder = builder.header(name.as_str(), value);
                }
            }
        }

        // Authentication.
        match &self.auth {
            AuthConfig::None => {}
            AuthConfig::Basic { username, password } => {
                builder = builder.basic_auth(username, password.as_deref());
            }
            AuthConfig::Bearer { token } => {
                builder = builder.bearer_auth(token);
            }
            AuthConfig::ApiKey { name, value, in_query } => {
                if *in_query {
                    query_pairs.push((name.clone(), value.clone()));
                } else {
                    builder = builder.header(name.as_str(), value.as_str());
                }
            }
            AuthConfig::OAuth2(oauth) => {
                let token = self.oauth_token(oauth).await?;
                builder = builder.bearer_auth(token);
            }
            AuthConfig::Custom { headers } => {
                for (name, value) in headers {
                    if let Some(value) = value.as_str() {
                        builder = builder.header(name.as_str(), value);
                    }
                }
            }
        }

        if !query_pairs.is_empty() {
            builder = builder.query(&query_pairs);
        }

        // Body: JSON by default, form-encoded on request.
        if let Some(body) = &request.data {
            let use_form = request
                .params
                .get("use_form_data")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if use_form {
                let form: Vec<(String, String)> = body
                    .as_object()
                    .map(|map| {
                        map.iter()
                            .map(|(k, v)| {
                                let rendered = match v {
                                    Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                };
                                (k.clone(), rendered)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                builder = builder.form(&form);
            } else {
                builder = builder.json(body);
            }
        }

        let response = tokio::select! {
            result = builder.send() => result.map_err(SyncError::from)?,
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        };

        let status = response.status().as_u16();
        let text = response.text().await.map_err(SyncError::from)?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        let (success, error) = self.evaluate_success(status, &body);
        if !success {
            tracing::warn!(url = %url, status, error = ?error, "upstream refused request");
            return Ok(DataResponse {
                success: false,
                data: Value::Null,
                error,
                metadata: ResponseMetadata::default(),
            });
        }

        let data = match &self.data_path {
            Some(path) => value_at_path(&body, path).cloned().unwrap_or(Value::Null),
            None => body.clone(),
        };

        let field_u64 = |path: &Option<String>| -> Option<u64> {
            path.as_deref()
                .and_then(|p| value_at_path(&body, p))
                .and_then(|v| v.as_u64())
        };

        Ok(DataResponse {
            success: true,
            data,
            error: None,
            metadata: ResponseMetadata {
                total: field_u64(&self.total_field),
                page: field_u64(&self.page_field),
                page_size: field_u64(&self.size_field),
            },
        })
    }
}
