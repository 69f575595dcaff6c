use mysql::{Binary, Conn, Opts, OptsBuilder, Params, QueryResult, Value, consts::ColumnType, prelude::Queryable};

use crate::{DataSourceConfig, DataSourceKind};

use super::{Cell, Connector, DriverError, ExportSession, Row, RowStream, count_sql, require_field, validate_sql};

#[derive(Debug, Clone, Copy)]
pub struct MySQLConnector;

impl Connector for MySQLConnector {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::MySQL
    }

    fn open(
        &self,
        config: &DataSourceConfig,
    ) -> Result<Box<dyn ExportSession>, DriverError> {
        let opts = build_opts(config)?;
        let conn = connect(opts.clone())?;
        Ok(Box::new(MySQLSession::new(conn, opts)))
    }

    fn check(
        &self,
        config: &DataSourceConfig,
    ) -> Result<(), DriverError> {
        let mut conn = connect(build_opts(config)?)?;
        conn.ping()
            .map_err(|err| DriverError::Connect(format!("ping 失败: {}", err)))?;
        Ok(())
    }
}

struct MySQLSession {
    conn: Conn,
    opts: Opts,
}

impl MySQLSession {
    fn new(
        conn: Conn,
        opts: Opts,
    ) -> Self {
        Self { conn, opts }
    }
}

impl ExportSession for MySQLSession {
    fn count(
        &mut self,
        sql: &str,
    ) -> Result<u64, DriverError> {
        validate_sql(sql)?;
        let sql = count_sql(sql);
        tracing::debug!(sql = %sql);

        let total: Option<u64> = self
            .conn
            .query_first(&sql)
            .map_err(|err| DriverError::Query(format!("统计行数失败: {}", err)))?;
        Ok(total.unwrap_or(0))
    }

    fn stream(
        &mut self,
        sql: &str,
        batch_size: usize,
    ) -> Result<Box<dyn RowStream + '_>, DriverError> {
        validate_sql(sql)?;
        tracing::debug!(sql = %sql, batch_size);

        let killer = QueryKiller {
            opts: self.opts.clone(),
            connection_id: self.conn.connection_id(),
        };
        // 结果集不在客户端缓冲，迭代时逐行从连接读取
        let result = self
            .conn
            .exec_iter(sql, Params::Empty)
            .map_err(|err| DriverError::Query(format!("执行查询失败: {}", err)))?;

        Ok(Box::new(MySQLRowStream {
            result,
            killer,
            batch_size: batch_size.max(1),
            done: false,
        }))
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        // Conn 在 drop 时发送 COM_QUIT 并关闭套接字
        drop(self.conn);
        Ok(())
    }
}

/// 未读完就 drop 时，QueryResult 会把剩余行全部从套接字读走；
/// 先在另一条连接上 KILL QUERY，让服务端提前结束结果集。
struct MySQLRowStream<'a> {
    result: QueryResult<'a, 'a, 'a, Binary>,
    killer: QueryKiller,
    batch_size: usize,
    done: bool,
}

impl Drop for MySQLRowStream<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.killer.kill();
        }
    }
}

struct QueryKiller {
    opts: Opts,
    connection_id: u32,
}

impl QueryKiller {
    fn kill(&self) {
        let sql = kill_query_sql(self.connection_id);
        let result = connect(self.opts.clone()).and_then(|mut conn| {
            conn.query_drop(&sql)
                .map_err(|err| DriverError::Query(err.to_string()))
        });
        match result {
            Ok(()) => tracing::debug!("已终止未读完的查询: {}", sql),
            Err(err) => tracing::warn!("终止查询失败，将读完剩余结果: {}", err),
        }
    }
}

fn kill_query_sql(connection_id: u32) -> String {
    format!("KILL QUERY {}", connection_id)
}

impl RowStream for MySQLRowStream<'_> {
    fn next_batch(&mut self) -> Result<Option<Vec<Row>>, DriverError> {
        if self.done {
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(self.batch_size);
        while rows.len() < self.batch_size {
            match self.result.next() {
                Some(row) => {
                    let row = row.map_err(|err| DriverError::Query(format!("读取结果失败: {}", err)))?;
                    rows.push(parse_row(row));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }

        if rows.is_empty() { Ok(None) } else { Ok(Some(rows)) }
    }
}

fn build_opts(config: &DataSourceConfig) -> Result<Opts, DriverError> {
    require_field(&config.host, "host")?;
    require_field(&config.username, "username")?;

    let mut builder = OptsBuilder::new();
    builder = builder.ip_or_hostname(Some(config.host.trim().to_string()));
    builder = builder.tcp_port(config.port_or_default());
    builder = builder.user(Some(config.username.clone()));
    builder = builder.pass(Some(config.password.clone()));
    if !config.database.trim().is_empty() {
        builder = builder.db_name(Some(config.database.trim().to_string()));
    }
    builder = builder.init(vec!["SET NAMES utf8mb4"]);

    tracing::debug!("连接 MySQL: {}", config.endpoint());
    Ok(Opts::from(builder))
}

fn connect(opts: Opts) -> Result<Conn, DriverError> {
    Conn::new(opts).map_err(|err| DriverError::Connect(err.to_string()))
}

fn parse_row(row: mysql::Row) -> Row {
    let kinds: Vec<ColumnType> = row.columns_ref().iter().map(|col| col.column_type()).collect();
    row.unwrap()
        .into_iter()
        .zip(kinds)
        .map(|(value, kind)| parse_value(value, kind))
        .collect()
}

fn parse_value(
    value: Value,
    kind: ColumnType,
) -> Cell {
    match value {
        Value::NULL => Cell::Null,
        Value::Int(int) => Cell::Int(int),
        Value::UInt(uint) => i64::try_from(uint).map_or(Cell::Float(uint as f64), Cell::Int),
        Value::Float(float) => Cell::Float(float as f64),
        Value::Double(double) => Cell::Float(double),
        Value::Bytes(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            match kind {
                ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => match text.parse::<f64>() {
                    Ok(number) => Cell::Float(number),
                    Err(_) => Cell::Text(text),
                },
                _ => Cell::Text(text),
            }
        }
        Value::Date(year, month, day, hour, minute, second, micros) => {
            if kind == ColumnType::MYSQL_TYPE_DATE {
                Cell::Text(format!("{year:04}-{month:02}-{day:02}"))
            } else if micros == 0 {
                Cell::Text(format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"))
            } else {
                Cell::Text(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                ))
            }
        }
        Value::Time(neg, days, hours, minutes, seconds, micros) => {
            let sign = if neg { "-" } else { "" };
            let hours = days * 24 + u32::from(hours);
            if micros == 0 {
                Cell::Text(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}"))
            } else {
                Cell::Text(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_keep_native_types() {
        assert_eq!(parse_value(Value::NULL, ColumnType::MYSQL_TYPE_LONG), Cell::Null);
        assert_eq!(parse_value(Value::Int(-7), ColumnType::MYSQL_TYPE_LONG), Cell::Int(-7));
        assert_eq!(parse_value(Value::UInt(u64::MAX), ColumnType::MYSQL_TYPE_LONGLONG), Cell::Float(u64::MAX as f64));
        assert_eq!(parse_value(Value::Double(1.5), ColumnType::MYSQL_TYPE_DOUBLE), Cell::Float(1.5));
        assert_eq!(
            parse_value(Value::Bytes(b"12.50".to_vec()), ColumnType::MYSQL_TYPE_NEWDECIMAL),
            Cell::Float(12.5)
        );
        assert_eq!(
            parse_value(Value::Bytes("张三".as_bytes().to_vec()), ColumnType::MYSQL_TYPE_VAR_STRING),
            Cell::Text("张三".into())
        );
    }

    #[test]
    fn kill_targets_the_streaming_connection() {
        assert_eq!(kill_query_sql(42), "KILL QUERY 42");
    }

    #[test]
    fn temporal_values_are_formatted() {
        assert_eq!(
            parse_value(Value::Date(2024, 3, 9, 0, 0, 0, 0), ColumnType::MYSQL_TYPE_DATE),
            Cell::Text("2024-03-09".into())
        );
        assert_eq!(
            parse_value(Value::Date(2024, 3, 9, 8, 5, 1, 0), ColumnType::MYSQL_TYPE_DATETIME),
            Cell::Text("2024-03-09 08:05:01".into())
        );
        assert_eq!(
            parse_value(Value::Time(true, 1, 2, 3, 4, 0), ColumnType::MYSQL_TYPE_TIME),
            Cell::Text("-26:03:04".into())
        );
    }
}
