//! Authored index definitions for the application collections

use super::definition::{CatalogError, IndexDefinition, IndexDirection::*};
use crate::query::Filter;
use std::collections::{BTreeMap, BTreeSet};

pub const USERS: &str = "users";
pub const WORKS: &str = "works";
pub const KNOWLEDGE_GRAPHS: &str = "knowledge_graphs";
pub const CONTRIBUTION_LOGS: &str = "contribution_logs";
pub const SESSIONS: &str = "sessions";

/// Index definitions grouped by collection
#[derive(Debug, Clone, Default)]
pub struct IndexCatalog {
    collections: BTreeMap<String, Vec<IndexDefinition>>,
}

impl IndexCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from definitions, rejecting invalid or duplicate entries
    pub fn from_definitions(definitions: Vec<IndexDefinition>) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for definition in definitions {
            catalog
                .collections
                .entry(definition.collection.clone())
                .or_default()
                .push(definition);
        }
        catalog.validate()?;
        Ok(catalog)
    }

    /// The indexes the application relies on
    pub fn default_catalog() -> Self {
        let mut catalog = Self::new();
        for definition in default_definitions() {
            catalog
                .collections
                .entry(definition.collection.clone())
                .or_default()
                .push(definition);
        }
        catalog
    }

    pub fn for_collection(&self, collection: &str) -> &[IndexDefinition] {
        self.collections
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn find(&self, collection: &str, name: &str) -> Option<&IndexDefinition> {
        self.for_collection(collection)
            .iter()
            .find(|d| d.name == name)
    }

    /// Collection names in sorted order
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Every definition, collection by collection
    pub fn definitions(&self) -> impl Iterator<Item = &IndexDefinition> {
        self.collections.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check name uniqueness and per-definition consistency
    pub fn validate(&self) -> Result<(), CatalogError> {
        for (collection, definitions) in &self.collections {
            let mut seen = BTreeSet::new();
            for definition in definitions {
                if !seen.insert(definition.name.as_str()) {
                    return Err(CatalogError::DuplicateName {
                        collection: collection.clone(),
                        name: definition.name.clone(),
                    });
                }
                definition.validate()?;
            }
        }
        Ok(())
    }
}

fn default_definitions() -> Vec<IndexDefinition> {
    vec![
        // users
        IndexDefinition::single(USERS, "email_unique", "email", Ascending).unique(),
        IndexDefinition::compound(
            USERS,
            "subscription_plan_status",
            &[("subscription.plan", Ascending), ("subscription.status", Ascending)],
        ),
        IndexDefinition::single(USERS, "created_at", "createdAt", Descending),
        IndexDefinition::text(USERS, "profile_text", &["name", "bio"])
            .weight("name", 10)
            .weight("bio", 2),
        IndexDefinition::geospatial(USERS, "school_location", "school.location").sparse(),
        // works
        IndexDefinition::compound(WORKS, "author_created", &[("author", Ascending), ("createdAt", Descending)]),
        IndexDefinition::partial(
            WORKS,
            "published_recent",
            &[("status", Ascending), ("publishedAt", Descending)],
            Filter::eq("status", "published"),
        ),
        IndexDefinition::compound(
            WORKS,
            "subject_grade",
            &[("subject", Ascending), ("gradeLevel", Ascending), ("createdAt", Descending)],
        ),
        IndexDefinition::compound(
            WORKS,
            "popularity",
            &[("likesCount", Descending), ("reuseCount", Descending)],
        ),
        IndexDefinition::single(WORKS, "tags", "tags", Ascending),
        IndexDefinition::text(WORKS, "content_text", &["title", "knowledgePoint", "description"])
            .weight("title", 10)
            .weight("knowledgePoint", 5)
            .weight("description", 1)
            .default_language("none"),
        // knowledge graphs
        IndexDefinition::compound(
            KNOWLEDGE_GRAPHS,
            "user_type",
            &[("userId", Ascending), ("type", Ascending)],
        ),
        IndexDefinition::partial(
            KNOWLEDGE_GRAPHS,
            "public_updated",
            &[("isPublic", Ascending), ("updatedAt", Descending)],
            Filter::eq("isPublic", true),
        ),
        IndexDefinition::sparse_keys(KNOWLEDGE_GRAPHS, "node_ids", &[("nodes.id", Ascending)]),
        // contribution logs
        IndexDefinition::compound(
            CONTRIBUTION_LOGS,
            "user_created",
            &[("userId", Ascending), ("createdAt", Descending)],
        ),
        IndexDefinition::compound(
            CONTRIBUTION_LOGS,
            "work_type",
            &[("workId", Ascending), ("type", Ascending)],
        ),
        IndexDefinition::compound(
            CONTRIBUTION_LOGS,
            "points_created",
            &[("points", Descending), ("createdAt", Descending)],
        ),
        // sessions
        IndexDefinition::single(SESSIONS, "token_unique", "token", Ascending).unique(),
        IndexDefinition::ttl(SESSIONS, "expires_ttl", "expiresAt", 0),
        IndexDefinition::compound(
            SESSIONS,
            "user_activity",
            &[("userId", Ascending), ("lastActivity", Descending)],
        ),
        IndexDefinition::hashed(SESSIONS, "user_hashed", "userId"),
    ]
}
