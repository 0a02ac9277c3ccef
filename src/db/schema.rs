//! Service tables. Per-upload data tables are created at runtime by the
//! table store, not here.

use crate::table_store::quote_ident;
use sqlx::PgPool;
use tracing::info;

pub const CREATE_FILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id UUID PRIMARY KEY,
    owner_id TEXT NOT NULL,
    folder_id TEXT,
    file_name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    table_name TEXT NOT NULL UNIQUE,
    original_headers JSONB NOT NULL DEFAULT '[]'::jsonb,
    ai_summary TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    row_count BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

pub const CREATE_FILES_OWNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS files_owner_folder_idx ON files (owner_id, folder_id)";

/// Tokens issued by the identity provider in front of this service.
pub const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_sessions (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    email TEXT,
    expires_at TIMESTAMPTZ NOT NULL
)
"#;

/// Role that chat SQL runs as: no login, SELECT on stored tables only.
/// Tables created before the role existed are granted here as well.
pub fn query_role_statements(role: &str) -> Vec<String> {
    let literal = role.replace('\'', "''");
    let ident = quote_ident(role);
    vec![
        format!(
            "DO $$ BEGIN \
             IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = '{literal}') THEN \
             CREATE ROLE {ident} NOLOGIN; \
             END IF; \
             END $$"
        ),
        format!("GRANT {} TO CURRENT_USER", ident),
        format!(
            "DO $$ BEGIN \
             EXECUTE format('GRANT USAGE ON SCHEMA %I TO %I', current_schema(), '{literal}'); \
             END $$"
        ),
        format!(
            "DO $$ DECLARE t text; BEGIN \
             FOR t IN SELECT tablename FROM pg_tables \
             WHERE schemaname = current_schema() AND tablename LIKE 'csv\\_%' LOOP \
             EXECUTE format('GRANT SELECT ON %I TO %I', t, '{literal}'); \
             END LOOP; \
             END $$"
        ),
    ]
}

pub async fn run_migrations(pool: &PgPool, query_role: Option<&str>) -> Result<(), sqlx::Error> {
    for statement in [CREATE_FILES_TABLE, CREATE_FILES_OWNER_INDEX, CREATE_SESSIONS_TABLE] {
        sqlx::query(statement).execute(pool).await?;
    }
    if let Some(role) = query_role {
        for statement in query_role_statements(role) {
            sqlx::query(&statement).execute(pool).await?;
        }
        info!("Query role {} ready", role);
    }
    info!("Schema migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_role_is_created_without_login_and_limited_to_stored_tables() {
        let statements = query_role_statements("csv_reader");
        assert_eq!(statements.len(), 4);
        assert!(statements[0].contains("rolname = 'csv_reader'"));
        assert!(statements[0].contains("CREATE ROLE \"csv_reader\" NOLOGIN"));
        assert_eq!(statements[1], "GRANT \"csv_reader\" TO CURRENT_USER");
        assert!(statements[3].contains("LIKE 'csv\\_%'"));
        assert!(statements.iter().all(|s| !s.contains("user_sessions") && !s.contains(" files")));
    }
}
