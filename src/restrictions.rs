//! Restriction evaluator (component H): resolves the caller's identity from
//! a bearer-style token and filters records whose `keywords` entry excludes
//! that identity from an allow-list.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::MySqlPool;

use crate::err::Result;

pub const TOKEN_HEADER: &str = "x-bioindex-access-token";
pub const TOKEN_QUERY_PARAM: &str = "access_token";

/// Validates a bearer token against an identity provider, returning the
/// associated email when the token is valid.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Option<String>;
}

/// Always-deny validator used when no identity provider is configured;
/// every request is treated as unauthenticated.
pub struct NoopTokenValidator;

#[async_trait]
impl TokenValidator for NoopTokenValidator {
    async fn validate(&self, _token: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct RestrictionRow {
    name: String,
    keywords: String,
    allow: String,
}

/// One row's restriction: a field/value predicate plus the list of emails
/// (or `*`) exempted from it.
#[derive(Debug, Clone)]
struct Restriction {
    keywords: serde_json::Map<String, Value>,
    allow: Vec<String>,
}

/// The resolved set of restrictions a reader must apply for one request,
/// scoped to the caller's (possibly absent) identity.
#[derive(Debug, Clone, Default)]
pub struct Restrictions {
    email: Option<String>,
    restrictions: Vec<Restriction>,
}

impl Restrictions {
    /// Resolves the caller's identity from `token` (if any) and loads every
    /// restriction row the portal schema defines for `restriction_name`
    /// that the caller is not exempted from.
    pub async fn resolve(
        pool: Option<&MySqlPool>,
        validator: &dyn TokenValidator,
        restriction_name: &str,
        token: Option<&str>,
    ) -> Result<Self> {
        let email = match token {
            Some(token) => validator.validate(token).await,
            None => None,
        };

        let Some(pool) = pool else {
            return Ok(Self {
                email,
                restrictions: Vec::new(),
            });
        };

        let rows = sqlx::query_as::<_, RestrictionRow>(
            r#"
            SELECT r.name AS name, r.keywords AS keywords,
                   COALESCE(GROUP_CONCAT(u.email), '') AS allow
            FROM Restrictions r
            LEFT JOIN Users u ON u.restriction = r.name
            WHERE r.name = ?
            GROUP BY r.id
            "#,
        )
        .bind(restriction_name)
        .fetch_all(pool)
        .await?;

        let restrictions = rows
            .into_iter()
            .filter_map(|row| {
                let keywords: Value = serde_json::from_str(&row.keywords).ok()?;
                let keywords = keywords.as_object()?.clone();
                let allow = row.allow.split(',').map(str::to_string).collect();
                Some(Restriction { keywords, allow })
            })
            .collect();

        Ok(Self { email, restrictions })
    }

    pub fn is_restricted(&self) -> bool {
        !self.restrictions.is_empty()
    }

    /// Returns whether `record` passes every loaded restriction for the
    /// current caller. A restriction is satisfied when the caller's email
    /// (or `*`) is in its allow-list, OR the record does not match the
    /// restriction's keyword predicate at all.
    pub fn allows(&self, record: &Value) -> bool {
        self.restrictions.iter().all(|restriction| {
            if !matches_keywords(record, &restriction.keywords) {
                return true;
            }
            let allowed = restriction
                .allow
                .iter()
                .any(|entry| entry == "*" || Some(entry.as_str()) == self.email.as_deref());
            allowed
        })
    }
}

fn matches_keywords(record: &Value, keywords: &serde_json::Map<String, Value>) -> bool {
    let Some(record) = record.as_object() else {
        return false;
    };
    keywords.iter().all(|(field, expected)| {
        let Some(actual) = record.get(field) else {
            return false;
        };
        match expected {
            Value::Array(values) => values.contains(actual),
            other => other == actual,
        }
    })
}

pub fn extract_token<'a>(header: Option<&'a str>, query_param: Option<&'a str>) -> Option<&'a str> {
    header
        .map(|h| h.trim_start_matches("Bearer ").trim())
        .or(query_param)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn allows_when_no_restrictions_loaded() {
        let restrictions = Restrictions::default();
        assert!(restrictions.allows(&json!({"gene": "BRCA1"})));
    }

    #[test]
    fn restriction_blocks_non_matching_caller() {
        let restrictions = Restrictions {
            email: Some("alice@example.com".into()),
            restrictions: vec![Restriction {
                keywords: json!({"gene": "BRCA1"}).as_object().unwrap().clone(),
                allow: vec!["bob@example.com".into()],
            }],
        };
        assert!(!restrictions.allows(&json!({"gene": "BRCA1"})));
        assert!(restrictions.allows(&json!({"gene": "TP53"})));
    }

    #[test]
    fn wildcard_allow_passes_everyone() {
        let restrictions = Restrictions {
            email: None,
            restrictions: vec![Restriction {
                keywords: json!({"gene": "BRCA1"}).as_object().unwrap().clone(),
                allow: vec!["*".into()],
            }],
        };
        assert!(restrictions.allows(&json!({"gene": "BRCA1"})));
    }

    #[test]
    fn extract_token_prefers_header() {
        assert_eq!(
            extract_token(Some("Bearer abc"), Some("def")),
            Some("abc")
        );
        assert_eq!(extract_token(None, Some("def")), Some("def"));
        assert_eq!(extract_token(None, None), None);
    }
}
