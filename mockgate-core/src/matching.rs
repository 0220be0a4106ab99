//! Per-call mock decision.
//!
//! [`MatchEngine::decide`] runs a fixed sequence of steps against one
//! snapshot. Any decode or evaluation problem inside a step counts as "no
//! match" for that step and the sequence continues; the only error it ever
//! returns is [`MatchError::MatchRequired`].

use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::grpc::{metadata_value, metadata_values};
use crate::schema::{JsonOptions, decode, encode_json, to_json};
use crate::snapshot::{Route, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("matched fail, check request and cases")]
    MatchRequired { method: String },
}

/// Metadata keys and values that steer matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchKeys {
    pub enable_key: String,
    /// `enable_key` value that makes a mock mandatory.
    pub enable_value: String,
    /// `enable_key` value that forces passthrough.
    pub disable_value: String,
    pub custom_case_key: String,
    /// Keys naming a case explicitly; the first one present wins.
    pub case_keys: Vec<String>,
    pub app_key: String,
}

impl Default for MatchKeys {
    fn default() -> Self {
        Self {
            enable_key: "mock".to_string(),
            enable_value: "yes".to_string(),
            disable_value: "no".to_string(),
            custom_case_key: "custom_case".to_string(),
            case_keys: vec!["case".to_string(), "case_name".to_string()],
            app_key: "tested_app_name".to_string(),
        }
    }
}

impl MatchKeys {
    /// Metadata keys are lower-case on HTTP/2.
    pub fn normalized(mut self) -> Self {
        self.enable_key.make_ascii_lowercase();
        self.custom_case_key.make_ascii_lowercase();
        self.app_key.make_ascii_lowercase();
        for key in &mut self.case_keys {
            key.make_ascii_lowercase();
        }
        self
    }

    /// The app namespace a call selects, if any.
    pub fn app<'a>(&self, metadata: &'a HeaderMap) -> Option<&'a str> {
        metadata_value(metadata, &self.app_key).filter(|v| !v.is_empty())
    }
}

/// Inputs of one decision.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub method: &'a str,
    pub app: Option<&'a str>,
    pub metadata: &'a HeaderMap,
    /// First request frame payload.
    pub request: &'a [u8],
}

/// A synthesized response.
#[derive(Debug, Clone, PartialEq)]
pub struct MockBody {
    /// Case that produced it; `None` for custom payloads.
    pub case_name: Option<String>,
    /// Wire encoding of the response message.
    pub message: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockDecision {
    None,
    MatchedMetadata(MockBody),
    MatchedBody(MockBody),
}

impl MockDecision {
    pub fn is_mocked(&self) -> bool {
        !matches!(self, MockDecision::None)
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            MockDecision::None => "proxied",
            MockDecision::MatchedMetadata(_) => "mocked_metadata",
            MockDecision::MatchedBody(_) => "mocked_body",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchEngine {
    keys: MatchKeys,
    view: JsonOptions,
}

impl MatchEngine {
    pub fn new(keys: MatchKeys, enums_as_ints: bool) -> Self {
        Self {
            keys: keys.normalized(),
            view: JsonOptions::for_matching(enums_as_ints),
        }
    }

    pub fn keys(&self) -> &MatchKeys {
        &self.keys
    }

    /// Decide whether `call` is mocked. `route` is the call's entry in
    /// `snapshot`.
    ///
    /// # Errors
    ///
    /// `MatchError::MatchRequired` when the caller demanded a mock and no
    /// step produced one.
    pub fn decide(
        &self,
        snapshot: &Snapshot,
        route: &Route,
        call: &CallContext<'_>,
    ) -> Result<MockDecision, MatchError> {
        // Every value of the enable key counts; disable beats enable.
        let switch = metadata_values(call.metadata, &self.keys.enable_key);
        if switch.contains(&self.keys.disable_value.as_str()) {
            debug!(method = call.method, "Mocking disabled by metadata");
            return Ok(MockDecision::None);
        }

        if let Some(body) = self.custom_case(route, call) {
            return Ok(MockDecision::MatchedMetadata(body));
        }

        if let Some(body) = self.named_case(snapshot, call) {
            return Ok(MockDecision::MatchedMetadata(body));
        }

        if let Some(body) = self.rule_match(snapshot, route, call) {
            return Ok(MockDecision::MatchedBody(body));
        }

        if switch.contains(&self.keys.enable_value.as_str()) {
            return Err(MatchError::MatchRequired {
                method: call.method.to_string(),
            });
        }
        Ok(MockDecision::None)
    }

    fn custom_case(&self, route: &Route, call: &CallContext<'_>) -> Option<MockBody> {
        let text = metadata_value(call.metadata, &self.keys.custom_case_key)?;
        let encoded = serde_json::from_str::<serde_json::Value>(text)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                encode_json(&route.descriptor.output, &json).map_err(|e| e.to_string())
            });
        match encoded {
            Ok(message) => {
                debug!(method = call.method, "Custom case payload from metadata");
                Some(MockBody {
                    case_name: None,
                    message,
                })
            }
            Err(error) => {
                warn!(method = call.method, %error, "Ignoring custom case payload");
                None
            }
        }
    }

    fn named_case(&self, snapshot: &Snapshot, call: &CallContext<'_>) -> Option<MockBody> {
        let name = self
            .keys
            .case_keys
            .iter()
            .find_map(|key| metadata_value(call.metadata, key))
            .filter(|name| !name.is_empty())?;
        let app = call.app.unwrap_or_default();
        let found = snapshot
            .case_table(call.method, app)
            .and_then(|table| table.get(name));
        match found {
            Some(compiled) => match &compiled.response {
                Some(message) => {
                    debug!(method = call.method, app, case = name, "Case selected by name");
                    Some(MockBody {
                        case_name: Some(compiled.case.name.clone()),
                        message: message.clone(),
                    })
                }
                None => {
                    debug!(method = call.method, app, case = name, "Named case has unusable body");
                    None
                }
            },
            None => {
                debug!(method = call.method, app, case = name, "Named case not found");
                None
            }
        }
    }

    fn rule_match(&self, snapshot: &Snapshot, route: &Route, call: &CallContext<'_>) -> Option<MockBody> {
        let mut candidates = snapshot
            .candidates(call.method, call.app)
            .filter(|c| c.rule.is_some())
            .peekable();
        // Skip decoding entirely when nothing could match.
        candidates.peek()?;

        let request = match decode(&route.descriptor.input, call.request)
            .and_then(|message| to_json(&message, &self.view))
        {
            Ok(view) => view,
            Err(e) => {
                debug!(method = call.method, error = %e, "Request does not decode, skipping rules");
                return None;
            }
        };

        for compiled in candidates {
            let Some(rule) = &compiled.rule else {
                continue;
            };
            match rule.evaluate(&request) {
                Ok(true) => match &compiled.response {
                    Some(message) => {
                        debug!(
                            method = call.method,
                            app = %compiled.case.app,
                            case = %compiled.case.name,
                            "Case matched by rule"
                        );
                        return Some(MockBody {
                            case_name: Some(compiled.case.name.clone()),
                            message: message.clone(),
                        });
                    }
                    None => {
                        debug!(case = %compiled.case.name, "Matching case has unusable body");
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    debug!(case = %compiled.case.name, error = %e, "Rule evaluation failed");
                }
            }
        }
        None
    }
}
