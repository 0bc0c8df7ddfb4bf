//! Rewrite GUID references for a destination environment.

use tmlsync_content::{ContentDocument, Rewrite};
use tmlsync_storage::GuidMappingStore;

/// Pure rewrite of a document's identity and embedded references through a
/// `GuidMappingStore`. No network or disk I/O.
#[derive(Debug, Clone)]
pub struct Disambiguator<'a> {
    mapping: &'a GuidMappingStore,
    dest_env: &'a str,
    delete_unresolved: bool,
    remap_object_guid: bool,
}

impl<'a> Disambiguator<'a> {
    pub fn new(mapping: &'a GuidMappingStore, dest_env: &'a str) -> Self {
        Self {
            mapping,
            dest_env,
            delete_unresolved: false,
            remap_object_guid: true,
        }
    }

    /// Remove the fields holding unmapped references instead of passing them
    /// through. The field is dropped, not set to an empty string. An unmapped
    /// `guid` is removed the same way. Used when force-creating.
    pub fn delete_unresolved(mut self, yes: bool) -> Self {
        self.delete_unresolved = yes;
        self
    }

    /// Leave the document's own `guid` untouched.
    pub fn remap_object_guid(mut self, yes: bool) -> Self {
        self.remap_object_guid = yes;
        self
    }

    pub fn rewrite(&self, document: &ContentDocument) -> ContentDocument {
        let mut out = document.clone();

        out.rewrite_references(|reference| {
            match self.mapping.lookup(&reference.value, self.dest_env) {
                Some(guid) => Rewrite::Replace(guid.to_string()),
                None if self.delete_unresolved => Rewrite::Clear,
                None => Rewrite::Keep,
            }
        });

        if self.remap_object_guid {
            if let Some(guid) = document.guid() {
                match self.mapping.lookup(guid, self.dest_env) {
                    Some(mapped) => {
                        if let Err(err) = out.set_guid(mapped) {
                            tracing::warn!(
                                guid,
                                mapped,
                                error = %err,
                                "mapping holds a malformed guid; keeping the original identity"
                            );
                        }
                    }
                    None if self.delete_unresolved => out.clear_guid(),
                    None => {}
                }
            }
        }
        out
    }
}
