// packages/engine/src/discrimination/matcher.rs
//! Session matchers and their registry
//!
//! A [`SessionMatcher`] bundles the pattern groups configured for one session
//! type. The [`MatcherRegistry`] maps session types to matchers; updates
//! compile the new matcher first and then swap it in, so readers see either
//! the old matcher or the complete new one.

use crate::discrimination::pattern::PatternGroup;
use crate::discrimination::scene::{Feature, Scene};
use crate::discrimination::session::SessionDoc;
use crate::utils::errors::{EngineError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Service name of the matcher applied to every outbound call
pub const WILDCARD_SERVICE: &str = "*";

/// Matcher configuration for one session type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionMatcherCnf {
    pub session_type: String,
    pub keep_n_sessions_per_scene: u64,
    pub inbound_request_patterns: BTreeMap<String, String>,
    pub inbound_response_patterns: BTreeMap<String, String>,
    pub call_outbounds: Vec<CallOutboundMatcherCnf>,
}

/// Patterns applied to calls to one downstream service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CallOutboundMatcherCnf {
    /// Empty or `"*"` means every service
    pub service_name: String,
    pub request_patterns: BTreeMap<String, String>,
    pub response_patterns: BTreeMap<String, String>,
}

#[derive(Debug)]
struct CallOutboundMatcher {
    request: Option<PatternGroup>,
    response: Option<PatternGroup>,
}

/// Compiled matcher for one session type
#[derive(Debug)]
pub struct SessionMatcher {
    session_type: String,
    keep_n_sessions_per_scene: u64,
    inbound_request: Option<PatternGroup>,
    inbound_response: Option<PatternGroup>,
    call_outbounds: HashMap<String, CallOutboundMatcher>,
}

/// Scene plus the dedup fingerprint of the spans that produced it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub scene: Scene,

    /// Concatenation of the raw matched spans, in discovery order
    pub fingerprint: Vec<u8>,
}

impl Extraction {
    fn absorb(&mut self, group: Option<&PatternGroup>, haystack: &str) {
        let Some(group) = group else {
            return;
        };
        for found in group.find(haystack.as_bytes()) {
            self.fingerprint.extend_from_slice(found.span);
            self.scene.push(Feature::new(found.key, found.value));
        }
    }
}

impl SessionMatcher {
    /// Compile every pattern group in `cnf`
    pub fn compile(cnf: &SessionMatcherCnf) -> Result<Self> {
        let mut call_outbounds = HashMap::with_capacity(cnf.call_outbounds.len());
        for outbound in &cnf.call_outbounds {
            let service = if outbound.service_name.is_empty() {
                WILDCARD_SERVICE.to_string()
            } else {
                outbound.service_name.clone()
            };
            call_outbounds.insert(
                service,
                CallOutboundMatcher {
                    request: PatternGroup::compile_optional(&outbound.request_patterns)?,
                    response: PatternGroup::compile_optional(&outbound.response_patterns)?,
                },
            );
        }

        Ok(Self {
            session_type: cnf.session_type.clone(),
            keep_n_sessions_per_scene: cnf.keep_n_sessions_per_scene,
            inbound_request: PatternGroup::compile_optional(&cnf.inbound_request_patterns)?,
            inbound_response: PatternGroup::compile_optional(&cnf.inbound_response_patterns)?,
            call_outbounds,
        })
    }

    pub fn session_type(&self) -> &str {
        &self.session_type
    }

    pub fn keep_n_sessions_per_scene(&self) -> u64 {
        self.keep_n_sessions_per_scene
    }

    /// Exact matcher for `service` (if any), then the wildcard matcher
    fn outbound_matchers<'m>(
        &'m self,
        service: &str,
    ) -> impl Iterator<Item = &'m CallOutboundMatcher> {
        let exact = if service == WILDCARD_SERVICE {
            None
        } else {
            self.call_outbounds.get(service)
        };
        exact
            .into_iter()
            .chain(self.call_outbounds.get(WILDCARD_SERVICE))
    }

    /// Walk the session in document order and collect every feature
    pub fn extract(&self, doc: &SessionDoc<'_>) -> Extraction {
        let mut extraction = Extraction::default();
        extraction.absorb(self.inbound_request.as_ref(), doc.inbound_request());
        extraction.absorb(self.inbound_response.as_ref(), doc.inbound_response());

        for action in &doc.actions {
            for matcher in self.outbound_matchers(&action.service_name) {
                extraction.absorb(matcher.request.as_ref(), &action.request);
                extraction.absorb(matcher.response.as_ref(), &action.response);
            }
        }
        extraction
    }
}

/// Session type to matcher map
#[derive(Default)]
pub struct MatcherRegistry {
    matchers: RwLock<HashMap<String, Arc<SessionMatcher>>>,
}

impl MatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `cnf` and replace the matcher of its session type
    pub fn update(&self, cnf: &SessionMatcherCnf) -> Result<()> {
        if cnf.session_type.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "session type must not be empty".to_string(),
            ));
        }
        let matcher = Arc::new(SessionMatcher::compile(cnf)?);

        info!(
            "Updating session matcher for {} ({} outbound services, keep {} per scene)",
            cnf.session_type,
            cnf.call_outbounds.len(),
            cnf.keep_n_sessions_per_scene
        );
        self.matchers
            .write()
            .insert(cnf.session_type.clone(), matcher);
        Ok(())
    }

    /// Matcher registered for `session_type`
    pub fn get(&self, session_type: &str) -> Option<Arc<SessionMatcher>> {
        let found = self.matchers.read().get(session_type).cloned();
        if found.is_none() {
            debug!("No session matcher for {}", session_type);
        }
        found
    }

    pub fn remove(&self, session_type: &str) -> bool {
        self.matchers.write().remove(session_type).is_some()
    }

    /// Registered session types, sorted
    pub fn session_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.matchers.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.matchers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.read().is_empty()
    }
}
