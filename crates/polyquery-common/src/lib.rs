use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;

pub use error::{DbError, DbResult, EngineError};

/// Storage engines a query can be emitted for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Sqlite,
    Postgres,
    Mysql,
    Document,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Sqlite => "sqlite",
            EngineKind::Postgres => "postgres",
            EngineKind::Mysql => "mysql",
            EngineKind::Document => "document",
        }
    }

    pub fn is_relational(&self) -> bool {
        !matches!(self, EngineKind::Document)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(EngineKind::Sqlite),
            "postgres" | "postgresql" | "pg" => Some(EngineKind::Postgres),
            "mysql" | "mariadb" => Some(EngineKind::Mysql),
            "document" | "mongodb" | "mongo" => Some(EngineKind::Document),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    /// 1 / -1 as used by document-store sort specs.
    pub fn as_document(&self) -> i64 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }

    /// Lenient parse: anything starting with "desc" (any case) is descending.
    pub fn parse(s: &str) -> Self {
        if s.trim().to_ascii_lowercase().starts_with("desc") {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }
}

impl Default for SortDirection {
    fn default() -> Self {
        SortDirection::Asc
    }
}

impl From<&str> for SortDirection {
    fn from(s: &str) -> Self {
        SortDirection::parse(s)
    }
}
