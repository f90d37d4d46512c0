//! Reserved topic construction and topic matching rules
//!
//! Every shadow and jobs topic is namespaced by the thing name under
//! `$aws/things/{thing}`. Identifiers are validated newtypes so a topic can
//! never be built from a name containing `/`, `+` or `#`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

static THING_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9:_-]{1,128}$").expect("valid thing name pattern"));

static JOB_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("valid job id pattern"));

/// Validation errors for topic identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Thing name cannot be empty")]
    EmptyThingName,
    #[error("Thing name '{0}' must match [a-zA-Z0-9:_-]{{1,128}}")]
    InvalidThingName(String),
    #[error("Job id '{0}' must match [a-zA-Z0-9_-]{{1,64}}")]
    InvalidJobId(String),
}

/// Name of the thing every topic is namespaced by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThingName(String);

impl ThingName {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::EmptyThingName);
        }
        if !THING_NAME_PATTERN.is_match(&name) {
            return Err(ValidationError::InvalidThingName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ThingName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ThingName> for String {
    fn from(value: ThingName) -> Self {
        value.0
    }
}

impl fmt::Display for ThingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if !JOB_ID_PATTERN.is_match(&id) {
            return Err(ValidationError::InvalidJobId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing rule evaluated against an inbound topic
///
/// All rules compare whole `/`-separated levels, so `jobs/get` never matches
/// `jobs/getter` and a job called `get` cannot capture the directory's list
/// responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicMatch {
    /// The topic equals the stored value
    Exact(String),
    /// The topic equals the stored value or lies anywhere below it
    Prefix(String),
    /// The topic lies exactly one level below the stored value
    Child(String),
}

impl TopicMatch {
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicMatch::Exact(expected) => topic == expected,
            TopicMatch::Prefix(prefix) => {
                topic == prefix || remainder_below(prefix, topic).is_some()
            }
            TopicMatch::Child(parent) => remainder_below(parent, topic)
                .map(|rest| !rest.is_empty() && !rest.contains('/'))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for TopicMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicMatch::Exact(t) => write!(f, "exact({t})"),
            TopicMatch::Prefix(t) => write!(f, "prefix({t})"),
            TopicMatch::Child(t) => write!(f, "child({t})"),
        }
    }
}

/// Part of `topic` after `parent/`, if `topic` is below `parent`
fn remainder_below<'a>(parent: &str, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// MQTT subscription filter matching with `+` and `#` wildcards
pub fn topic_matches_filter(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Which sibling of a request topic a response arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Accepted,
    Rejected,
    Other,
}

impl ResponseKind {
    pub fn of(topic: &str) -> Self {
        match topic.rsplit('/').next() {
            Some("accepted") => ResponseKind::Accepted,
            Some("rejected") => ResponseKind::Rejected,
            _ => ResponseKind::Other,
        }
    }
}

/// Topic construction for one thing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThingTopics {
    root: String,
}

impl ThingTopics {
    pub fn new(thing: &ThingName) -> Self {
        Self {
            root: format!("$aws/things/{thing}"),
        }
    }

    /// `$aws/things/{thing}/shadow/update`
    pub fn shadow_update(&self) -> String {
        format!("{}/shadow/update", self.root)
    }

    /// `$aws/things/{thing}/shadow/update/delta`
    pub fn shadow_delta(&self) -> String {
        format!("{}/shadow/update/delta", self.root)
    }

    /// `$aws/things/{thing}/jobs/notify`
    pub fn jobs_notify(&self) -> String {
        format!("{}/jobs/notify", self.root)
    }

    /// `$aws/things/{thing}/jobs/get`
    pub fn jobs_get(&self) -> String {
        format!("{}/jobs/get", self.root)
    }

    /// Subscription covering `jobs/get/accepted` and `jobs/get/rejected`
    pub fn jobs_get_responses(&self) -> String {
        format!("{}/+", self.jobs_get())
    }

    pub fn job(&self, job_id: &JobId) -> JobTopics {
        JobTopics {
            prefix: format!("{}/jobs/{job_id}", self.root),
        }
    }
}

/// Topic construction for one job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTopics {
    prefix: String,
}

impl JobTopics {
    /// `$aws/things/{thing}/jobs/{jobId}/get`
    pub fn get(&self) -> String {
        format!("{}/get", self.prefix)
    }

    pub fn get_responses(&self) -> String {
        format!("{}/+", self.get())
    }

    /// `$aws/things/{thing}/jobs/{jobId}/update`
    pub fn update(&self) -> String {
        format!("{}/update", self.prefix)
    }

    /// `$aws/things/{thing}/jobs/{jobId}/updated`, used by the legacy protocol
    pub fn updated(&self) -> String {
        format!("{}/updated", self.prefix)
    }
}
