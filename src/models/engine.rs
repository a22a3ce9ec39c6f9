//! Database engine selector.

use serde::{Deserialize, Serialize};

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    PostgreSQL,
    /// Includes MariaDB and Aurora
    MySQL,
    SQLite,
}

impl Engine {
    /// Parse the engine from a connection string scheme.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Parse the engine from a configuration name such as `"postgres"`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" | "aurora" => Some(Self::MySQL),
            "sqlite" | "sqlite3" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Registry key used by the provider registry.
    pub fn key(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }

    /// Get the display name for this engine.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_connection_string() {
        assert_eq!(
            Engine::from_connection_string("postgres://u:p@h/db"),
            Some(Engine::PostgreSQL)
        );
        assert_eq!(
            Engine::from_connection_string("MariaDB://h/db"),
            Some(Engine::MySQL)
        );
        assert_eq!(
            Engine::from_connection_string("sqlite::memory:"),
            Some(Engine::SQLite)
        );
        assert_eq!(Engine::from_connection_string("mssql://h/db"), None);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Engine::from_name("PostgreSQL"), Some(Engine::PostgreSQL));
        assert_eq!(Engine::from_name(" mariadb "), Some(Engine::MySQL));
        assert_eq!(Engine::from_name("sqlite3"), Some(Engine::SQLite));
        assert_eq!(Engine::from_name("oracle"), None);
    }

    #[test]
    fn test_key_round_trips_through_from_name() {
        for engine in [Engine::PostgreSQL, Engine::MySQL, Engine::SQLite] {
            assert_eq!(Engine::from_name(engine.key()), Some(engine));
        }
    }
}
