//! Index-ready document types.
//!
//! These are the denormalized shapes delivered to Elasticsearch. Every
//! document is validated before delivery; a document that fails validation
//! is skipped and logged, never silently dropped (see the transformer).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A person reference embedded in a filmwork document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: Uuid,
    pub name: String,
}

/// Denormalized movie document for the movies index.
///
/// `director` is always present in the serialized form: a film without a
/// director credit carries an explicit `null`, not an omitted field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilmworkDocument {
    pub id: Uuid,
    pub imdb_rating: Option<f64>,
    pub genre: Vec<String>,
    pub title: String,
    pub description: Option<String>,
    pub director: Option<String>,
    pub actors_names: Vec<String>,
    pub writers_names: Vec<String>,
    pub actors: Vec<PersonRef>,
    pub writers: Vec<PersonRef>,
}

impl FilmworkDocument {
    /// Check required fields and list-shape invariants.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(Error::Validation("filmwork document has nil id".to_string()));
        }
        if self.title.is_empty() {
            return Err(Error::Validation(format!(
                "filmwork {} has an empty title",
                self.id
            )));
        }
        if self.actors.len() != self.actors_names.len() {
            return Err(Error::Validation(format!(
                "filmwork {}: actors/actors_names length mismatch",
                self.id
            )));
        }
        if self.writers.len() != self.writers_names.len() {
            return Err(Error::Validation(format!(
                "filmwork {}: writers/writers_names length mismatch",
                self.id
            )));
        }
        Ok(())
    }
}

/// Shallow genre projection for the genres index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenreDocument {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

impl GenreDocument {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(Error::Validation("genre document has nil id".to_string()));
        }
        if self.name.is_empty() {
            return Err(Error::Validation(format!(
                "genre {} has an empty name",
                self.id
            )));
        }
        Ok(())
    }
}

/// Person projection for the persons index.
///
/// `role` holds the distinct set of roles across all of the person's
/// credits; order is not significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonDocument {
    pub id: Uuid,
    pub full_name: String,
    pub role: Vec<String>,
}

impl PersonDocument {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(Error::Validation("person document has nil id".to_string()));
        }
        if self.full_name.is_empty() {
            return Err(Error::Validation(format!(
                "person {} has an empty name",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filmwork() -> FilmworkDocument {
        FilmworkDocument {
            id: Uuid::new_v4(),
            imdb_rating: Some(7.5),
            genre: vec!["Drama".to_string()],
            title: "The Test".to_string(),
            description: None,
            director: None,
            actors_names: vec![],
            writers_names: vec![],
            actors: vec![],
            writers: vec![],
        }
    }

    #[test]
    fn test_valid_filmwork_passes() {
        assert!(filmwork().validate().is_ok());
    }

    #[test]
    fn test_empty_title_rejected() {
        let mut doc = filmwork();
        doc.title.clear();
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_parallel_list_mismatch_rejected() {
        let mut doc = filmwork();
        doc.actors_names.push("Orphan Name".to_string());
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_absent_director_serializes_as_null() {
        let doc = filmwork();
        let value = serde_json::to_value(&doc).unwrap();
        assert!(value.get("director").is_some());
        assert!(value["director"].is_null());
    }
}
