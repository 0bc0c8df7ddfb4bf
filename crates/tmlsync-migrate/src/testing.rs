//! In-memory `ContentApi` for tests.
//!
//! `FakeApi` behaves like a single remote environment: it stores documents by
//! GUID, answers listings through `ContentFilter::matches`, assigns fresh
//! GUIDs on force-create, and records every call so tests can assert on what
//! was (or was not) sent. Failure modes are switched on per test.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde_json::Value;
use tmlsync_content::{ContentDocument, ContentType, MetadataType, MigrationStatus, Rewrite};
use uuid::Uuid;

use crate::api::{
    ApiError, ContentApi, ContentFilter, ContentHeader, ExportedObject, ImportOutcome,
    ImportPolicy, ShareTarget,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    ListContent {
        guid_count: usize,
    },
    ExportTml {
        guids: Vec<String>,
        with_associated: bool,
        export_fqn: bool,
    },
    ExportConnection {
        guid: String,
    },
    ParentsOf {
        guid: String,
    },
    ImportTml {
        count: usize,
        policy: ImportPolicy,
        force_create: bool,
    },
    CreateConnection {
        name: String,
    },
    UpdateConnection {
        guid: String,
    },
    AssignTags {
        guids: Vec<String>,
        metadata_type: MetadataType,
        tags: Vec<String>,
    },
    Share {
        guids: Vec<String>,
        metadata_type: MetadataType,
    },
}

impl ApiCall {
    /// Calls that change remote state.
    pub fn is_mutation(&self) -> bool {
        match self {
            ApiCall::ImportTml { policy, .. } => policy.mutates(),
            ApiCall::CreateConnection { .. }
            | ApiCall::UpdateConnection { .. }
            | ApiCall::AssignTags { .. }
            | ApiCall::Share { .. } => true,
            _ => false,
        }
    }

    pub fn is_post_processing(&self) -> bool {
        matches!(self, ApiCall::AssignTags { .. } | ApiCall::Share { .. })
    }
}

#[derive(Debug, Clone)]
struct Stored {
    header: ContentHeader,
    body: Value,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Stored>,
    parents: BTreeMap<String, Vec<ContentHeader>>,
    export_failures: BTreeSet<String>,
    import_failures: BTreeSet<String>,
    /// Listing calls left before an object becomes visible.
    hidden: BTreeMap<String, usize>,
    visibility_delay: usize,
    short_import_response: bool,
    fail_post_processing: bool,
    calls: Vec<ApiCall>,
}

impl State {
    fn store(&mut self, guid: &str, mut document: ContentDocument) -> String {
        let key = guid.to_ascii_lowercase();
        if document.set_guid(guid).is_err() {
            document.clear_guid();
        }
        let (author, tags) = self
            .objects
            .get(&key)
            .map(|s| (s.header.author.clone(), s.header.tags.clone()))
            .unwrap_or_default();
        let header = ContentHeader {
            guid: guid.to_string(),
            name: document.display_name().to_string(),
            content_type: document.content_type(),
            author,
            tags,
        };
        if self.visibility_delay > 0 {
            self.hidden.insert(key.clone(), self.visibility_delay);
        }
        self.objects.insert(
            key,
            Stored {
                header,
                body: document.into_body(),
            },
        );
        guid.to_string()
    }

    fn get(&self, guid: &str) -> Option<&Stored> {
        self.objects.get(&guid.to_ascii_lowercase())
    }
}

#[derive(Debug, Default)]
pub struct FakeApi {
    state: Mutex<State>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Seeding and failure switches
    // ------------------------------------------------------------------------

    /// Store `document` as if it already existed remotely. Documents without
    /// a GUID get a fresh one, which is returned.
    pub fn insert(&self, document: ContentDocument, author: Option<&str>, tags: &[&str]) -> String {
        let guid = document
            .guid()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = self.state.lock();
        state.store(&guid, document);
        if let Some(stored) = state.objects.get_mut(&guid.to_ascii_lowercase()) {
            stored.header.author = author.map(str::to_string);
            stored.header.tags = tags.iter().map(|t| t.to_string()).collect();
        }
        guid
    }

    pub fn set_parents(&self, guid: &str, parents: Vec<ContentHeader>) {
        self.state
            .lock()
            .parents
            .insert(guid.to_ascii_lowercase(), parents);
    }

    /// Exports of `guid` report `ERROR`.
    pub fn fail_export(&self, guid: &str) {
        self.state
            .lock()
            .export_failures
            .insert(guid.to_ascii_lowercase());
    }

    /// Imports of documents named `name` report `ERROR`.
    pub fn fail_import_named(&self, name: &str) {
        self.state.lock().import_failures.insert(name.to_string());
    }

    /// Objects stored from now on stay out of listings for `calls` listing
    /// calls.
    pub fn set_visibility_delay(&self, calls: usize) {
        self.state.lock().visibility_delay = calls;
    }

    /// Import responses drop their last entry.
    pub fn truncate_import_responses(&self) {
        self.state.lock().short_import_response = true;
    }

    /// Tag and share calls fail with HTTP 500.
    pub fn fail_post_processing(&self) {
        self.state.lock().fail_post_processing = true;
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    pub fn document(&self, guid: &str) -> Option<ContentDocument> {
        let state = self.state.lock();
        let stored = state.get(guid)?;
        ContentDocument::from_value(stored.body.clone()).ok()
    }

    pub fn tags_of(&self, guid: &str) -> Vec<String> {
        self.state
            .lock()
            .get(guid)
            .map(|s| s.header.tags.clone())
            .unwrap_or_default()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }
}

fn strip_references(body: &Value) -> Value {
    match ContentDocument::from_value(body.clone()) {
        Ok(mut doc) => {
            doc.rewrite_references(|_| Rewrite::Clear);
            doc.into_body()
        }
        Err(_) => body.clone(),
    }
}

impl ContentApi for FakeApi {
    fn list_content(&self, filter: &ContentFilter) -> Result<Vec<ContentHeader>, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::ListContent {
            guid_count: filter.guids.len(),
        });
        let headers: Vec<ContentHeader> = state
            .objects
            .iter()
            .filter(|(key, _)| !state.hidden.get(*key).is_some_and(|n| *n > 0))
            .map(|(_, s)| &s.header)
            .filter(|h| filter.matches(h))
            .cloned()
            .collect();
        state.hidden.retain(|_, n| {
            *n = n.saturating_sub(1);
            *n > 0
        });
        Ok(headers)
    }

    fn export_tml(
        &self,
        guids: &[String],
        with_associated: bool,
        export_fqn: bool,
    ) -> Result<Vec<ExportedObject>, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::ExportTml {
            guids: guids.to_vec(),
            with_associated,
            export_fqn,
        });

        let render = |s: &Stored| ExportedObject {
            guid: s.header.guid.clone(),
            content_type: Some(s.header.content_type),
            status: MigrationStatus::Ok,
            message: String::new(),
            body: Some(if export_fqn {
                s.body.clone()
            } else {
                strip_references(&s.body)
            }),
        };
        let failed = |guid: &str, content_type: Option<ContentType>, message: &str| ExportedObject {
            guid: guid.to_string(),
            content_type,
            status: MigrationStatus::Error,
            message: message.to_string(),
            body: None,
        };

        let mut out = Vec::new();
        for guid in guids {
            let stored = state.get(guid);
            if state.export_failures.contains(&guid.to_ascii_lowercase()) {
                out.push(failed(
                    guid,
                    stored.map(|s| s.header.content_type),
                    "Export failed<br/>User does not have access",
                ));
                continue;
            }
            match stored {
                None => out.push(failed(guid, None, "Object not found")),
                Some(s) if s.header.content_type.is_connection() => out.push(failed(
                    guid,
                    Some(ContentType::Connection),
                    "Connections are not exported through TML",
                )),
                Some(s) => {
                    out.push(render(s));
                    if !with_associated {
                        continue;
                    }
                    let Ok(doc) = ContentDocument::from_value(s.body.clone()) else {
                        continue;
                    };
                    for reference in doc.references() {
                        if let Some(dep) = state.get(&reference.value) {
                            if !dep.header.content_type.is_connection() {
                                out.push(render(dep));
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn export_connection(&self, guid: &str) -> Result<Value, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::ExportConnection {
            guid: guid.to_string(),
        });
        match state.get(guid) {
            Some(s) if s.header.content_type.is_connection() => Ok(s.body.clone()),
            _ => Err(ApiError::NotFound {
                guid: guid.to_string(),
            }),
        }
    }

    fn parents_of(&self, guid: &str) -> Result<Vec<ContentHeader>, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::ParentsOf {
            guid: guid.to_string(),
        });
        Ok(state
            .parents
            .get(&guid.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    fn import_tml(
        &self,
        documents: &[ContentDocument],
        policy: ImportPolicy,
        force_create: bool,
    ) -> Result<Vec<ImportOutcome>, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::ImportTml {
            count: documents.len(),
            policy,
            force_create,
        });

        let mut outcomes = Vec::with_capacity(documents.len());
        let mut staged = Vec::new();
        for doc in documents {
            let name = doc.display_name().to_string();
            if state.import_failures.contains(&name) {
                outcomes.push(ImportOutcome {
                    status: MigrationStatus::Error,
                    guid: None,
                    name: Some(name),
                    message: "Invalid TML<br/>Referenced table could not be found".to_string(),
                });
                continue;
            }
            if !policy.mutates() {
                outcomes.push(ImportOutcome {
                    status: MigrationStatus::Ok,
                    guid: None,
                    name: Some(name),
                    message: "Validation passed".to_string(),
                });
                continue;
            }
            let guid = match (force_create, doc.guid()) {
                (false, Some(guid)) => guid.to_string(),
                _ => Uuid::new_v4().to_string(),
            };
            outcomes.push(ImportOutcome::ok(&guid, &name));
            staged.push((guid, doc.clone()));
        }

        let rejected = policy == ImportPolicy::AllOrNone && outcomes.iter().any(|o| o.status.is_error());
        if !rejected {
            for (guid, doc) in staged {
                state.store(&guid, doc);
            }
        }
        if state.short_import_response {
            outcomes.pop();
        }
        Ok(outcomes)
    }

    fn create_connection(&self, document: &ContentDocument) -> Result<ImportOutcome, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::CreateConnection {
            name: document.display_name().to_string(),
        });
        let guid = state.store(&Uuid::new_v4().to_string(), document.clone());
        Ok(ImportOutcome::ok(guid, document.display_name()))
    }

    fn update_connection(
        &self,
        guid: &str,
        document: &ContentDocument,
    ) -> Result<ImportOutcome, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::UpdateConnection {
            guid: guid.to_string(),
        });
        if !state
            .get(guid)
            .is_some_and(|s| s.header.content_type.is_connection())
        {
            return Err(ApiError::NotFound {
                guid: guid.to_string(),
            });
        }
        let guid = state.store(guid, document.clone());
        Ok(ImportOutcome::ok(guid, document.display_name()))
    }

    fn assign_tags(
        &self,
        guids: &[String],
        metadata_type: MetadataType,
        tags: &[String],
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::AssignTags {
            guids: guids.to_vec(),
            metadata_type,
            tags: tags.to_vec(),
        });
        if state.fail_post_processing {
            return Err(ApiError::Http {
                url: "fake://tags/assign".to_string(),
                status: 500,
                body: "internal error".to_string(),
            });
        }
        for guid in guids {
            if let Some(stored) = state.objects.get_mut(&guid.to_ascii_lowercase()) {
                for tag in tags {
                    if !stored.header.tags.contains(tag) {
                        stored.header.tags.push(tag.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn share(
        &self,
        guids: &[String],
        metadata_type: MetadataType,
        _targets: &[ShareTarget],
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::Share {
            guids: guids.to_vec(),
            metadata_type,
        });
        if state.fail_post_processing {
            return Err(ApiError::Http {
                url: "fake://security/metadata/share".to_string(),
                status: 500,
                body: "internal error".to_string(),
            });
        }
        Ok(())
    }
}
