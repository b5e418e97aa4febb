use crate::config::MysqlConfig;
use crate::shell::{shell_quote, CommandRunner};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseCredential {
    pub name: String,
    pub user: String,
    pub secret: String,
}

impl fmt::Debug for DatabaseCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredential")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("secret", &"***")
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("ожидается name:user:secret, найдено полей: {0}")]
    FieldCount(usize),
    #[error("пустое имя базы или пользователя")]
    EmptyField,
}

impl DatabaseCredential {
    /// Splits on the first two colons only, so the secret may contain `:`.
    pub fn parse(entry: &str) -> Result<Self, CredentialError> {
        let parts: Vec<&str> = entry.splitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(CredentialError::FieldCount(parts.len()));
        }
        let name = parts[0].trim();
        let user = parts[1].trim();
        if name.is_empty() || user.is_empty() {
            return Err(CredentialError::EmptyField);
        }
        Ok(Self {
            name: name.to_string(),
            user: user.to_string(),
            secret: parts[2].to_string(),
        })
    }
}

#[derive(Debug, Default)]
pub struct ParsedCredentials {
    pub valid: Vec<DatabaseCredential>,
    /// 1-based positions of skipped entries in the configured list.
    pub skipped: Vec<usize>,
}

pub fn parse_credentials(entries: &[String]) -> ParsedCredentials {
    let mut out = ParsedCredentials::default();
    for (idx, entry) in entries.iter().enumerate() {
        match DatabaseCredential::parse(entry) {
            Ok(cred) => out.valid.push(cred),
            Err(err) => {
                warn!(position = idx + 1, error = %err, "пропущена некорректная запись базы данных");
                out.skipped.push(idx + 1);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub table_count: u64,
    /// Sum of `information_schema.tables.TABLE_ROWS`: an estimate for
    /// InnoDB, not an exact count.
    pub row_count: u64,
    pub column_count: u64,
}

#[derive(Debug, Clone, Copy)]
enum CatalogQuery {
    Tables,
    Rows,
    Columns,
}

impl CatalogQuery {
    fn sql(self, schema: &str) -> String {
        let schema = sql_literal(schema);
        match self {
            Self::Tables => format!(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema={schema};"
            ),
            Self::Rows => format!(
                "SELECT COALESCE(SUM(TABLE_ROWS),0) FROM information_schema.tables WHERE table_schema={schema};"
            ),
            Self::Columns => format!(
                "SELECT COUNT(*) FROM information_schema.columns WHERE table_schema={schema};"
            ),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Tables => "tables",
            Self::Rows => "rows",
            Self::Columns => "columns",
        }
    }
}

pub async fn collect_database_stats<R: CommandRunner + ?Sized>(
    runner: &R,
    mysql: &MysqlConfig,
    cred: &DatabaseCredential,
) -> DatabaseStats {
    DatabaseStats {
        table_count: run_query(runner, mysql, cred, CatalogQuery::Tables).await,
        row_count: run_query(runner, mysql, cred, CatalogQuery::Rows).await,
        column_count: run_query(runner, mysql, cred, CatalogQuery::Columns).await,
    }
}

pub fn totals<'a>(stats: impl IntoIterator<Item = &'a DatabaseStats>) -> DatabaseStats {
    stats
        .into_iter()
        .fold(DatabaseStats::default(), |acc, s| DatabaseStats {
            table_count: acc.table_count.saturating_add(s.table_count),
            row_count: acc.row_count.saturating_add(s.row_count),
            column_count: acc.column_count.saturating_add(s.column_count),
        })
}

async fn run_query<R: CommandRunner + ?Sized>(
    runner: &R,
    mysql: &MysqlConfig,
    cred: &DatabaseCredential,
    query: CatalogQuery,
) -> u64 {
    let script = mysql_command(mysql, &cred.user, &query.sql(&cred.name));
    let out = match runner
        .run_with_env(&script, &[("MYSQL_PWD", cred.secret.as_str())])
        .await
    {
        Ok(out) => out,
        Err(err) => {
            warn!(database = %cred.name, query = query.label(), error = %err, "не удалось выполнить запрос");
            return 0;
        }
    };

    match out.non_empty_stdout().and_then(|s| s.trim().parse::<u64>().ok()) {
        Some(v) => v,
        None => {
            debug!(
                database = %cred.name,
                query = query.label(),
                code = out.code,
                "запрос не вернул число, используется 0"
            );
            0
        }
    }
}

fn mysql_command(mysql: &MysqlConfig, user: &str, sql: &str) -> String {
    let mut script = format!("{} -u{}", shell_quote(&mysql.binary), shell_quote(user));
    if let Some(host) = &mysql.host {
        script.push_str(&format!(" -h{}", shell_quote(host)));
    }
    if let Some(port) = mysql.port {
        script.push_str(&format!(" -P{port}"));
    }
    script.push_str(&format!(" -N -B -e {} 2>/dev/null", shell_quote(sql)));
    script
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::ScriptedRunner;

    #[test]
    fn parse_accepts_colons_in_secret() {
        let cred = DatabaseCredential::parse("shop:shop_ro:pa:ss:word").expect("валидная запись");
        assert_eq!(cred.name, "shop");
        assert_eq!(cred.user, "shop_ro");
        assert_eq!(cred.secret, "pa:ss:word");
    }

    #[test]
    fn parse_rejects_wrong_field_count_and_empty_fields() {
        assert_eq!(
            DatabaseCredential::parse("shop:user"),
            Err(CredentialError::FieldCount(2))
        );
        assert_eq!(DatabaseCredential::parse(""), Err(CredentialError::FieldCount(1)));
        assert_eq!(
            DatabaseCredential::parse(":user:secret"),
            Err(CredentialError::EmptyField)
        );
    }

    #[test]
    fn debug_hides_secret() {
        let cred = DatabaseCredential::parse("shop:u:topsecret").expect("валидная запись");
        let text = format!("{cred:?}");
        assert!(!text.contains("topsecret"));
    }

    #[test]
    fn parse_credentials_records_skipped_positions() {
        let entries = vec![
            "a:u:p".to_string(),
            "broken".to_string(),
            "b:u:p".to_string(),
            "".to_string(),
        ];
        let parsed = parse_credentials(&entries);
        assert_eq!(parsed.valid.len(), 2);
        assert_eq!(parsed.skipped, vec![2, 4]);
    }

    #[test]
    fn schema_name_is_escaped_in_sql_and_shell() {
        let sql = CatalogQuery::Tables.sql("we'ird");
        assert!(sql.contains("table_schema='we''ird'"));
        let script = mysql_command(&MysqlConfig::default(), "ro", &sql);
        assert!(script.starts_with("'mysql' -u'ro' -N -B -e '"));
        assert!(!script.contains("-p"));
    }

    #[tokio::test]
    async fn failed_query_yields_zero_for_that_field_only() {
        let runner = ScriptedRunner::new()
            .ok("SELECT COUNT(*) FROM information_schema.tables", "12")
            .exit("SUM(TABLE_ROWS)", 1, "")
            .ok("information_schema.columns", "not a number");
        let cred = DatabaseCredential::parse("shop:ro:secret").expect("валидная запись");
        let stats = collect_database_stats(&runner, &MysqlConfig::default(), &cred).await;

        assert_eq!(
            stats,
            DatabaseStats {
                table_count: 12,
                row_count: 0,
                column_count: 0,
            }
        );
        assert_eq!(runner.calls().len(), 3);
        assert!(runner.calls().iter().all(|c| !c.contains("secret")));
    }

    #[tokio::test]
    async fn totals_cover_only_valid_entries() {
        let schema = |name: &str| sql_literal(name).replace('\'', "'\"'\"'");
        let runner = ScriptedRunner::new()
            .ok(&schema("a"), "5")
            .ok(&schema("b"), "7");
        let parsed = parse_credentials(&[
            "a:u:p".to_string(),
            "garbage".to_string(),
            "b:u:p".to_string(),
        ]);

        let mut all = Vec::new();
        for cred in &parsed.valid {
            all.push(collect_database_stats(&runner, &MysqlConfig::default(), cred).await);
        }
        let total = totals(&all);

        assert_eq!(total.table_count, 12);
        assert_eq!(total.row_count, 12);
        assert_eq!(total.column_count, 12);
        assert_eq!(
            total.table_count,
            all.iter().map(|s| s.table_count).sum::<u64>()
        );
        assert_eq!(parsed.skipped, vec![2]);
    }
}
