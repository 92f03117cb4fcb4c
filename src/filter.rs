// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record filters.
//!
//! A [`RecordFilter`] is a conjunction of optional predicates over record
//! metadata. It is evaluated in memory by [`RecordFilter::matches`] and
//! translated to a parameterized SQL `WHERE` clause by
//! [`RecordFilter::to_sql`] for the SQL backends.
//!
//! ```
//! use failover_engine::RecordFilter;
//!
//! let filter = RecordFilter::kind("event").created_after(1_000).limit(50);
//! let sql = filter.to_sql();
//! assert_eq!(sql.clause, "kind = ? AND created_at >= ?");
//! assert_eq!(sql.params.len(), 2);
//! ```

use crate::record::{Record, SyncState};

/// Predicates over record metadata. All set predicates must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub kind: Option<String>,
    pub ids: Option<Vec<String>>,
    /// Inclusive lower bound on `created_at`
    pub created_after: Option<i64>,
    /// Exclusive upper bound on `created_at`
    pub created_before: Option<i64>,
    /// Only honoured by stores that track sync state
    pub sync_state: Option<SyncState>,
    pub limit: Option<usize>,
}

/// SQL fragment with `?` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlQuery {
    /// The WHERE clause (without "WHERE" keyword), empty when unfiltered
    pub clause: String,
    /// Parameter values in placeholder order
    pub params: Vec<SqlParam>,
}

/// SQL parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
}

impl RecordFilter {
    /// Match everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Match a single kind.
    #[must_use]
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Match a set of ids.
    #[must_use]
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn created_after(mut self, ts: i64) -> Self {
        self.created_after = Some(ts);
        self
    }

    #[must_use]
    pub fn created_before(mut self, ts: i64) -> Self {
        self.created_before = Some(ts);
        self
    }

    #[must_use]
    pub fn sync_state(mut self, state: SyncState) -> Self {
        self.sync_state = Some(state);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Same predicates, no limit. Used when results from two stores are
    /// merged before truncation.
    #[must_use]
    pub fn without_limit(&self) -> Self {
        Self {
            limit: None,
            ..self.clone()
        }
    }

    /// Evaluate against a record in memory. `sync_state` is only checked
    /// when `check_state` is set.
    #[must_use]
    pub fn matches(&self, record: &Record, check_state: bool) -> bool {
        if let Some(ref kind) = self.kind {
            if &record.kind != kind {
                return false;
            }
        }
        if let Some(ref ids) = self.ids {
            if !ids.iter().any(|id| id == &record.id) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at >= before {
                return false;
            }
        }
        if check_state {
            if let Some(state) = self.sync_state {
                if record.sync_state != state {
                    return false;
                }
            }
        }
        true
    }

    /// Translate to a parameterized WHERE clause over the `records` columns.
    /// `sync_state` is not included; stores that track it add it themselves
    /// via [`RecordFilter::to_sql_with_state`].
    #[must_use]
    pub fn to_sql(&self) -> SqlQuery {
        self.translate(false)
    }

    /// Like [`to_sql`](Self::to_sql) but also constrains `sync_state`.
    #[must_use]
    pub fn to_sql_with_state(&self) -> SqlQuery {
        self.translate(true)
    }

    fn translate(&self, with_state: bool) -> SqlQuery {
        let mut parts = Vec::new();
        let mut params = Vec::new();

        if let Some(ref kind) = self.kind {
            parts.push("kind = ?".to_string());
            params.push(SqlParam::Text(kind.clone()));
        }
        if let Some(ref ids) = self.ids {
            if ids.is_empty() {
                // Empty IN () is invalid SQL; an empty id set matches nothing
                parts.push("1 = 0".to_string());
            } else {
                let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
                parts.push(format!("id IN ({})", placeholders.join(", ")));
                params.extend(ids.iter().cloned().map(SqlParam::Text));
            }
        }
        if let Some(after) = self.created_after {
            parts.push("created_at >= ?".to_string());
            params.push(SqlParam::Integer(after));
        }
        if let Some(before) = self.created_before {
            parts.push("created_at < ?".to_string());
            params.push(SqlParam::Integer(before));
        }
        if with_state {
            if let Some(state) = self.sync_state {
                parts.push("sync_state = ?".to_string());
                params.push(SqlParam::Text(state.as_str().to_string()));
            }
        }

        SqlQuery {
            clause: parts.join(" AND "),
            params,
        }
    }
}

impl SqlQuery {
    /// `" WHERE <clause>"`, or an empty string when unfiltered.
    #[must_use]
    pub fn where_sql(&self) -> String {
        if self.clause.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clause)
        }
    }

    /// Bind parameters onto a query in placeholder order.
    pub fn bind<'q>(
        &'q self,
        mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
        for param in &self.params {
            query = match param {
                SqlParam::Text(s) => query.bind(s.as_str()),
                SqlParam::Integer(n) => query.bind(*n),
            };
        }
        query
    }
}
