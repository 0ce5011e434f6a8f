//! SQL dialect seam.
//!
//! The NIC IP column is a variable-length list, which the two engines store
//! differently: the embedded engine keeps a JSON array in a TEXT column, the
//! server engine a native text array. Queries that filter on that column ask
//! the dialect for the right expression instead of hardcoding one form.

/// Storage engine dialect, detected from the DSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn detect(dsn: &str) -> Dialect {
        let lower = dsn.trim().to_ascii_lowercase();
        if lower.starts_with("postgres://")
            || lower.starts_with("postgresql://")
            || lower.contains("host=")
            || lower.contains("dbname=")
        {
            Dialect::Postgres
        } else {
            Dialect::Sqlite
        }
    }

    /// Expression testing whether `placeholder` is a member of the array
    /// column `column`.
    pub fn array_contains(&self, column: &str, placeholder: &str) -> String {
        match self {
            Dialect::Sqlite => format!(
                "EXISTS (SELECT 1 FROM json_each({column}) WHERE json_each.value = {placeholder})"
            ),
            Dialect::Postgres => format!("{placeholder} = ANY({column})"),
        }
    }

    /// Expression testing whether the array column `column` shares at least
    /// one element with the array bound at `placeholder`.
    pub fn array_overlaps(&self, column: &str, placeholder: &str) -> String {
        match self {
            Dialect::Sqlite => format!(
                "EXISTS (SELECT 1 FROM json_each({column}) \
                 WHERE json_each.value IN (SELECT value FROM json_each({placeholder})))"
            ),
            Dialect::Postgres => format!("{column} && {placeholder}::text[]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_from_dsn() {
        assert_eq!(Dialect::detect("situation.db"), Dialect::Sqlite);
        assert_eq!(Dialect::detect(":memory:"), Dialect::Sqlite);
        assert_eq!(Dialect::detect("/var/lib/situation/store.sqlite"), Dialect::Sqlite);
        assert_eq!(Dialect::detect("postgres://u:p@db/situation"), Dialect::Postgres);
        assert_eq!(Dialect::detect("host=db dbname=situation"), Dialect::Postgres);
    }

    #[test]
    fn sqlite_expressions_use_json_each() {
        let expr = Dialect::Sqlite.array_contains("ni.ip", "?");
        assert!(expr.contains("json_each(ni.ip)"));
        let expr = Dialect::Postgres.array_overlaps("ni.ip", "$2");
        assert_eq!(expr, "ni.ip && $2::text[]");
    }
}
