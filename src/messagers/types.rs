use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// One side effect requested by a messager
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write or delete a catalogue entry and announce the change
    CatalogueEntry(CatalogueEntryAction),
    /// Write or delete an arbitrary object; never announced
    Blob(DirectBlobAction),
    /// Record a failure without raising an error
    Failure(FailureAction),
}

impl Action {
    pub fn write_entry(cat_path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        CatalogueEntryAction::builder()
            .cat_path(cat_path)
            .body(body)
            .build()
            .into()
    }

    pub fn delete_entry(cat_path: impl Into<String>) -> Self {
        CatalogueEntryAction::builder().cat_path(cat_path).build().into()
    }

    pub fn write_blob(key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        DirectBlobAction::builder().key(key).body(body).build().into()
    }

    pub fn delete_blob(key: impl Into<String>) -> Self {
        DirectBlobAction::builder().key(key).build().into()
    }

    /// Whole-message failure
    pub fn failure(kind: FailureKind) -> Self {
        Action::Failure(FailureAction { key: None, kind })
    }

    /// Failure scoped to one input key
    pub fn key_failure(key: impl Into<String>, kind: FailureKind) -> Self {
        Action::Failure(FailureAction {
            key: Some(key.into()),
            kind,
        })
    }
}

/// Catalogue entry stored at `<output_prefix><cat_path>`.
///
/// A missing `body` means delete.
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct CatalogueEntryAction {
    #[builder(into)]
    pub cat_path: String,
    #[builder(into)]
    pub body: Option<Bytes>,
    /// Defaults to the messager's output bucket
    #[builder(into)]
    pub bucket: Option<String>,
    #[builder(into, default = DEFAULT_CONTENT_TYPE.to_string())]
    pub content_type: String,
    #[builder(into)]
    pub cache_control: Option<String>,
}

/// Object stored at an explicit key. A missing `body` means delete.
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct DirectBlobAction {
    #[builder(into)]
    pub key: String,
    #[builder(into)]
    pub body: Option<Bytes>,
    #[builder(into)]
    pub bucket: Option<String>,
    #[builder(into, default = DEFAULT_CONTENT_TYPE.to_string())]
    pub content_type: String,
    #[builder(into)]
    pub cache_control: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureAction {
    pub key: Option<String>,
    pub kind: FailureKind,
}

impl From<CatalogueEntryAction> for Action {
    fn from(action: CatalogueEntryAction) -> Self {
        Action::CatalogueEntry(action)
    }
}

impl From<DirectBlobAction> for Action {
    fn from(action: DirectBlobAction) -> Self {
        Action::Blob(action)
    }
}

impl From<FailureAction> for Action {
    fn from(action: FailureAction) -> Self {
        Action::Failure(action)
    }
}

/// Outcome of consuming one message.
///
/// `permanent`/`temporary` describe the message as a whole; the key lists
/// name individual entries of a multi-key message that failed. Both kinds
/// can be set at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failures {
    pub permanent: bool,
    pub temporary: bool,
    pub key_permanent: Vec<String>,
    pub key_temporary: Vec<String>,
}

impl Failures {
    pub fn permanent() -> Self {
        Self {
            permanent: true,
            ..Default::default()
        }
    }

    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Default::default()
        }
    }

    pub fn record(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Temporary => self.temporary = true,
            FailureKind::Permanent => self.permanent = true,
        }
    }

    pub fn record_key(&mut self, key: impl Into<String>, kind: FailureKind) {
        let list = match kind {
            FailureKind::Temporary => &mut self.key_temporary,
            FailureKind::Permanent => &mut self.key_permanent,
        };
        let key = key.into();
        if !list.contains(&key) {
            list.push(key);
        }
    }

    /// Order-preserving union of two outcomes
    pub fn merge(mut self, other: Failures) -> Self {
        self.permanent |= other.permanent;
        self.temporary |= other.temporary;
        for key in other.key_permanent {
            self.record_key(key, FailureKind::Permanent);
        }
        for key in other.key_temporary {
            self.record_key(key, FailureKind::Temporary);
        }
        self
    }

    /// Redelivery could help
    pub fn any_temporary(&self) -> bool {
        self.temporary || !self.key_temporary.is_empty()
    }

    pub fn any_permanent(&self) -> bool {
        self.permanent || !self.key_permanent.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.any_temporary() && !self.any_permanent()
    }
}

/// Keys touched while executing one message's actions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogueChanges {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl CatalogueChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Fill the key lists of an otherwise complete notification
    pub fn into_message(self, empty: CatalogueChangeMessage) -> CatalogueChangeMessage {
        CatalogueChangeMessage {
            added_keys: self.added,
            updated_keys: self.updated,
            deleted_keys: self.deleted,
            ..empty
        }
    }
}

/// Catalogue change envelope, consumed and produced by pipeline stages.
///
/// Keys in incoming messages have the form `<stage-prefix>/<catalogue-path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueChangeMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    pub bucket_name: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub added_keys: Vec<String>,
    #[serde(default)]
    pub updated_keys: Vec<String>,
    #[serde(default)]
    pub deleted_keys: Vec<String>,
}

impl CatalogueChangeMessage {
    pub fn new(
        bucket_name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            workspace: None,
            bucket_name: bucket_name.into(),
            source: source.into(),
            target: target.into(),
            added_keys: Vec::new(),
            updated_keys: Vec::new(),
            deleted_keys: Vec::new(),
        }
    }

    /// Header fields only, with empty key lists
    pub fn without_keys(&self) -> Self {
        Self {
            id: self.id.clone(),
            workspace: self.workspace.clone(),
            bucket_name: self.bucket_name.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            added_keys: Vec::new(),
            updated_keys: Vec::new(),
            deleted_keys: Vec::new(),
        }
    }
}
