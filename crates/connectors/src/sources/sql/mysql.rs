use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{
    params, DriverError, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, Value as MyValue,
};
use secrecy::ExposeSecret;
use serde_json::{Number, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use askql_common::config::{DatasourceConfig, MysqlSettings};
use askql_common::models::{ColumnInfo, TableInfo};

use crate::error::GatewayError;
use crate::sources::{BackendFactory, FetchedRows, SqlBackend};

// Server errors that may clear on a fresh attempt: too many connections,
// shutdown in progress, lock wait timeout, deadlock, execution time cap,
// plus the client-side "gone away"/"lost connection" codes.
const RETRYABLE_SERVER_CODES: &[u16] = &[1040, 1053, 1205, 1213, 3024, 2006, 2013];

const TABLES_SQL: &str = "SELECT TABLE_NAME, TABLE_TYPE, TABLE_COMMENT \
    FROM INFORMATION_SCHEMA.TABLES \
    WHERE TABLE_SCHEMA = DATABASE() \
    ORDER BY TABLE_NAME";

const COLUMNS_SQL: &str = "SELECT TABLE_NAME, COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY, COLUMN_COMMENT \
    FROM INFORMATION_SCHEMA.COLUMNS \
    WHERE TABLE_SCHEMA = DATABASE() \
    ORDER BY TABLE_NAME, ORDINAL_POSITION";

const TABLE_COLUMNS_SQL: &str = "SELECT TABLE_NAME, COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY, COLUMN_COMMENT \
    FROM INFORMATION_SCHEMA.COLUMNS \
    WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = :table \
    ORDER BY ORDINAL_POSITION";

type ColumnRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

#[derive(Debug, Clone)]
pub struct MySqlPoolSettings {
    pub pool_size: usize,
    pub max_overflow: usize,
    pub recycle: Duration,
    pub connect_timeout: Duration,
}

impl From<&MysqlSettings> for MySqlPoolSettings {
    fn from(s: &MysqlSettings) -> Self {
        Self {
            pool_size: s.pool_size,
            max_overflow: s.max_overflow,
            recycle: Duration::from_secs(s.pool_recycle_secs),
            connect_timeout: Duration::from_secs(s.connect_timeout_secs),
        }
    }
}

pub struct MySqlBackendFactory {
    settings: MySqlPoolSettings,
}

impl MySqlBackendFactory {
    pub fn new(settings: MySqlPoolSettings) -> Self {
        Self { settings }
    }
}

impl BackendFactory for MySqlBackendFactory {
    fn type_name(&self) -> &'static str {
        "mysql"
    }

    fn create(&self, ds: &DatasourceConfig) -> Result<Arc<dyn SqlBackend>, GatewayError> {
        let max = (self.settings.pool_size + self.settings.max_overflow).max(1);
        let constraints = PoolConstraints::new(self.settings.pool_size.min(max), max)
            .ok_or_else(|| GatewayError::Internal("invalid pool constraints".to_string()))?;
        let pool_opts = PoolOpts::default()
            .with_constraints(constraints)
            .with_abs_conn_ttl(Some(self.settings.recycle));

        let opts = OptsBuilder::default()
            .ip_or_hostname(ds.host.clone())
            .tcp_port(ds.port)
            .user(Some(ds.user.clone()))
            .pass(ds.password.as_ref().map(|p| p.expose_secret().to_string()))
            .db_name(Some(ds.database.clone()))
            .pool_opts(pool_opts);

        debug!(
            datasource = %ds.id,
            host = %ds.host,
            port = ds.port,
            max_connections = max,
            "created MySQL pool"
        );

        Ok(Arc::new(MySqlBackend {
            datasource_id: ds.id.clone(),
            pool: Pool::new(opts),
            connect_timeout: self.settings.connect_timeout,
        }))
    }
}

pub struct MySqlBackend {
    datasource_id: String,
    pool: Pool,
    connect_timeout: Duration,
}

impl MySqlBackend {
    async fn conn(&self) -> Result<mysql_async::Conn, GatewayError> {
        match tokio::time::timeout(self.connect_timeout, self.pool.get_conn()).await {
            Ok(conn) => conn.map_err(map_mysql_error),
            Err(_) => Err(GatewayError::Connection(format!(
                "connect to {} timed out after {:?}",
                self.datasource_id, self.connect_timeout
            ))),
        }
    }
}

#[async_trait]
impl SqlBackend for MySqlBackend {
    async fn fetch(
        &self,
        sql: &str,
        max_rows: usize,
        exec_cap: Option<Duration>,
    ) -> Result<FetchedRows, GatewayError> {
        let mut conn = self.conn().await?;

        if let Some(cap) = exec_cap.filter(|c| !c.is_zero()) {
            let stmt = format!("SET SESSION MAX_EXECUTION_TIME={}", cap.as_millis());
            if let Err(e) = conn.query_drop(stmt).await {
                // MariaDB and older servers reject this variable.
                debug!(datasource = %self.datasource_id, error = %e, "execution cap not applied");
            }
        }

        let mut result = conn.query_iter(sql).await.map_err(map_mysql_error)?;
        let column_types: Vec<ColumnType> = result
            .columns_ref()
            .iter()
            .map(|c| c.column_type())
            .collect();
        let columns: Vec<String> = result
            .columns_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();

        let mut rows = Vec::new();
        while rows.len() < max_rows {
            match result.next().await.map_err(map_mysql_error)? {
                Some(row) => rows.push(row_to_json(&row, &column_types)),
                None => break,
            }
        }
        result.drop_result().await.map_err(map_mysql_error)?;

        Ok((columns, rows))
    }

    async fn list_tables(&self) -> Result<Vec<TableInfo>, GatewayError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, String, Option<String>)> =
            conn.query(TABLES_SQL).await.map_err(map_mysql_error)?;

        Ok(rows
            .into_iter()
            .map(|(name, table_type, comment)| TableInfo {
                name,
                table_type,
                comment: comment.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_columns(&self, table: Option<&str>) -> Result<Vec<ColumnInfo>, GatewayError> {
        let mut conn = self.conn().await?;
        let rows: Vec<ColumnRow> = match table {
            Some(t) => conn
                .exec(TABLE_COLUMNS_SQL, params! { "table" => t })
                .await
                .map_err(map_mysql_error)?,
            None => conn.query(COLUMNS_SQL).await.map_err(map_mysql_error)?,
        };

        Ok(rows
            .into_iter()
            .map(
                |(table, column, data_type, column_type, nullable, key, comment)| ColumnInfo {
                    table,
                    column,
                    data_type,
                    column_type,
                    nullable: nullable.eq_ignore_ascii_case("YES"),
                    key: key.unwrap_or_default(),
                    comment: comment.unwrap_or_default(),
                },
            )
            .collect())
    }

    async fn close(&self) {
        if let Err(e) = self.pool.clone().disconnect().await {
            warn!(datasource = %self.datasource_id, error = %e, "error while closing MySQL pool");
        }
    }
}

pub fn is_retryable_server_code(code: u16) -> bool {
    RETRYABLE_SERVER_CODES.contains(&code)
}

fn map_mysql_error(err: mysql_async::Error) -> GatewayError {
    match err {
        mysql_async::Error::Io(e) => GatewayError::Connection(e.to_string()),
        mysql_async::Error::Driver(DriverError::ConnectionClosed)
        | mysql_async::Error::Driver(DriverError::PoolDisconnected) => {
            GatewayError::Connection("connection closed".to_string())
        }
        mysql_async::Error::Server(e) => GatewayError::Database {
            code: Some(e.code),
            retryable: is_retryable_server_code(e.code),
            message: e.message,
        },
        other => GatewayError::Internal(other.to_string()),
    }
}

fn row_to_json(row: &Row, column_types: &[ColumnType]) -> Vec<Value> {
    (0..row.len())
        .map(|i| {
            let column_type = column_types
                .get(i)
                .copied()
                .unwrap_or(ColumnType::MYSQL_TYPE_VAR_STRING);
            row.as_ref(i)
                .map(|v| value_to_json(v, column_type))
                .unwrap_or(Value::Null)
        })
        .collect()
}

/// Text-protocol values arrive as bytes; numeric columns are parsed back
/// into JSON numbers so charting can tell metrics from dimensions.
pub fn value_to_json(value: &MyValue, column_type: ColumnType) -> Value {
    match value {
        MyValue::NULL => Value::Null,
        MyValue::Int(i) => Value::from(*i),
        MyValue::UInt(u) => Value::from(*u),
        MyValue::Float(f) => float_json(f64::from(*f)),
        MyValue::Double(f) => float_json(*f),
        MyValue::Bytes(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if is_integer_type(column_type) {
                if let Ok(i) = text.parse::<i64>() {
                    return Value::from(i);
                }
                if let Ok(u) = text.parse::<u64>() {
                    return Value::from(u);
                }
            } else if is_decimal_type(column_type) {
                if let Ok(f) = text.parse::<f64>() {
                    return float_json(f);
                }
            }
            Value::String(text.into_owned())
        }
        MyValue::Date(y, m, d, h, mi, s, us) => {
            if *h == 0 && *mi == 0 && *s == 0 && *us == 0 {
                Value::String(format!("{y:04}-{m:02}-{d:02}"))
            } else {
                Value::String(format!("{y:04}-{m:02}-{d:02} {h:02}:{mi:02}:{s:02}"))
            }
        }
        MyValue::Time(neg, days, h, m, s, _) => {
            let hours = u32::from(*h) + days * 24;
            let sign = if *neg { "-" } else { "" };
            Value::String(format!("{sign}{hours:02}:{m:02}:{s:02}"))
        }
    }
}

fn float_json(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn is_integer_type(t: ColumnType) -> bool {
    matches!(
        t,
        ColumnType::MYSQL_TYPE_TINY
            | ColumnType::MYSQL_TYPE_SHORT
            | ColumnType::MYSQL_TYPE_LONG
            | ColumnType::MYSQL_TYPE_LONGLONG
            | ColumnType::MYSQL_TYPE_INT24
            | ColumnType::MYSQL_TYPE_YEAR
    )
}

fn is_decimal_type(t: ColumnType) -> bool {
    matches!(
        t,
        ColumnType::MYSQL_TYPE_DECIMAL
            | ColumnType::MYSQL_TYPE_NEWDECIMAL
            | ColumnType::MYSQL_TYPE_FLOAT
            | ColumnType::MYSQL_TYPE_DOUBLE
    )
}
