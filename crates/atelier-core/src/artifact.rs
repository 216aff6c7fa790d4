//! Versioned, lineage-tracked units of generated text.
//!
//! Every piece of generated output (a contract document, a schema, a source
//! file, a build manifest) is an [`Artifact`]. Repairs never mutate an
//! artifact in place: they produce a new version whose `parent` points at the
//! failing one, so the full repair lineage of a job stays auditable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline role that produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Design role: contracts, schemas.
    Design,
    /// Coding role: application source.
    Code,
    /// Repair role: corrected versions of failing artifacts.
    Repair,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Design => "design",
            Role::Code => "code",
            Role::Repair => "repair",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned unit of generated text output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    /// Job this artifact belongs to.
    pub job_id: Uuid,
    /// Logical file path within the generated project (e.g. `src/main/...`).
    pub path: String,
    /// Raw content. Opaque text as far as the core is concerned.
    pub content: String,
    /// Role that produced this version.
    pub produced_by: Role,
    /// Generation round the artifact was produced in.
    pub round: u32,
    /// Version number, strictly increasing per path within a job.
    pub version: u32,
    /// For repaired artifacts, the id of the version this one replaces.
    pub parent: Option<Uuid>,
    /// Diagnostic output attached by an external validator, if any.
    pub diagnostic: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Create a fresh artifact at version 1 with no lineage.
    pub fn new(
        job_id: Uuid,
        path: impl Into<String>,
        content: impl Into<String>,
        produced_by: Role,
        round: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            path: path.into(),
            content: content.into(),
            produced_by,
            round,
            version: 1,
            parent: None,
            diagnostic: None,
            created_at: Utc::now(),
        }
    }

    /// Attach validator/compiler output to this artifact.
    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    /// Produce the repaired successor of this artifact.
    ///
    /// The new version is `version + 1`, its parent is this artifact, and it
    /// carries no diagnostic (it has not been validated yet). The original is
    /// left untouched.
    pub fn repaired(&self, content: impl Into<String>) -> Artifact {
        Artifact {
            id: Uuid::new_v4(),
            job_id: self.job_id,
            path: self.path.clone(),
            content: content.into(),
            produced_by: Role::Repair,
            round: self.round + 1,
            version: self.version + 1,
            parent: Some(self.id),
            diagnostic: None,
            created_at: Utc::now(),
        }
    }

    /// File name component of the artifact path.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}
