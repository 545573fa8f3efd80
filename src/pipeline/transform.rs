//! Row-to-document assembly.
//!
//! Pure functions from raw joined rows to index documents: no I/O, no side
//! effects. Credits are partitioned by role per filmwork (`director` is a
//! scalar, `writer`/`actor` build `{id, name}` lists plus parallel name-only
//! lists in credit encounter order); person documents collapse each person's
//! credits into a distinct role set.
//!
//! Every assembled document is validated before it is returned. A document
//! that fails validation is skipped and logged at warn, so one malformed
//! record never fails the batch and is never dropped silently.

use crate::pipeline::documents::{FilmworkDocument, GenreDocument, PersonDocument, PersonRef};
use crate::source::{CreditRow, FilmworkRow, GenreRow, PersonRoleRow};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Which credit wins when a film carries multiple director credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectorPrecedence {
    /// Keep the first director credit encountered.
    FirstCredit,
    /// Keep the last director credit encountered (reference behavior).
    #[default]
    LastCredit,
}

/// Assemble movie documents from aggregate rows and their credits.
pub fn build_filmwork_documents(
    filmworks: &[FilmworkRow],
    credits: &[CreditRow],
    precedence: DirectorPrecedence,
) -> Vec<FilmworkDocument> {
    let mut credits_by_film: HashMap<Uuid, Vec<&CreditRow>> = HashMap::new();
    for credit in credits {
        credits_by_film.entry(credit.film_id).or_default().push(credit);
    }

    let mut documents = Vec::with_capacity(filmworks.len());
    for film in filmworks {
        let mut director: Option<String> = None;
        let mut actors = Vec::new();
        let mut actors_names = Vec::new();
        let mut writers = Vec::new();
        let mut writers_names = Vec::new();

        if let Some(film_credits) = credits_by_film.get(&film.id) {
            for credit in film_credits {
                match credit.role.as_str() {
                    "director" => {
                        if director.is_none() || precedence == DirectorPrecedence::LastCredit {
                            director = Some(credit.full_name.clone());
                        }
                    }
                    "writer" => {
                        writers.push(PersonRef {
                            id: credit.person_id,
                            name: credit.full_name.clone(),
                        });
                        writers_names.push(credit.full_name.clone());
                    }
                    "actor" => {
                        actors.push(PersonRef {
                            id: credit.person_id,
                            name: credit.full_name.clone(),
                        });
                        actors_names.push(credit.full_name.clone());
                    }
                    other => {
                        tracing::debug!("Ignoring unmapped credit role {:?}", other);
                    }
                }
            }
        }

        let document = FilmworkDocument {
            id: film.id,
            imdb_rating: film.rating,
            genre: film.genres.clone(),
            title: film.title.clone(),
            description: film.description.clone(),
            director,
            actors_names,
            writers_names,
            actors,
            writers,
        };

        match document.validate() {
            Ok(()) => documents.push(document),
            Err(e) => tracing::warn!("Skipping invalid filmwork document: {}", e),
        }
    }
    documents
}

/// Assemble genre documents.
pub fn build_genre_documents(rows: &[GenreRow]) -> Vec<GenreDocument> {
    let mut documents = Vec::with_capacity(rows.len());
    for row in rows {
        let document = GenreDocument {
            id: row.id,
            name: row.name.clone(),
            description: row.description.clone(),
        };
        match document.validate() {
            Ok(()) => documents.push(document),
            Err(e) => tracing::warn!("Skipping invalid genre document: {}", e),
        }
    }
    documents
}

/// Assemble person documents, one per person, with the distinct role set
/// held across all of their credits.
pub fn build_person_documents(rows: &[PersonRoleRow]) -> Vec<PersonDocument> {
    let mut roles_by_person: HashMap<Uuid, Vec<String>> = HashMap::new();
    let mut order: Vec<(Uuid, String)> = Vec::new();
    let mut seen_persons = HashSet::new();

    for row in rows {
        let roles = roles_by_person.entry(row.person_id).or_default();
        if !roles.contains(&row.role) {
            roles.push(row.role.clone());
        }
        if seen_persons.insert(row.person_id) {
            order.push((row.person_id, row.full_name.clone()));
        }
    }

    let mut documents = Vec::with_capacity(order.len());
    for (person_id, full_name) in order {
        let document = PersonDocument {
            id: person_id,
            full_name,
            role: roles_by_person.remove(&person_id).unwrap_or_default(),
        };
        match document.validate() {
            Ok(()) => documents.push(document),
            Err(e) => tracing::warn!("Skipping invalid person document: {}", e),
        }
    }
    documents
}
