use std::{error::Error, fmt::Write};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres::{
    Client, Config, Error as PostgresError, NoTls, Portal, Transaction,
    types::{FromSql, Type},
};

use crate::{DataSourceConfig, DataSourceKind};

use super::{Cell, Connector, DriverError, ExportSession, Row, RowStream, count_sql, require_field, validate_sql};

#[derive(Debug, Clone, Copy)]
pub struct PostgresConnector;

impl Connector for PostgresConnector {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::Postgres
    }

    fn open(
        &self,
        config: &DataSourceConfig,
    ) -> Result<Box<dyn ExportSession>, DriverError> {
        let client = open_conn(config)?;
        Ok(Box::new(PostgresSession::new(client)))
    }

    fn check(
        &self,
        config: &DataSourceConfig,
    ) -> Result<(), DriverError> {
        let mut client = open_conn(config)?;
        client
            .simple_query("SELECT 1")
            .map_err(|err| DriverError::Connect(format!("校验查询失败: {}", err)))?;
        client
            .close()
            .map_err(|err| DriverError::Connect(format!("关闭连接失败: {}", err)))
    }
}

struct PostgresSession {
    client: Client,
}

impl PostgresSession {
    fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ExportSession for PostgresSession {
    fn count(
        &mut self,
        sql: &str,
    ) -> Result<u64, DriverError> {
        validate_sql(sql)?;
        let sql = count_sql(sql);
        tracing::debug!(sql = %sql);

        let row = self
            .client
            .query_one(sql.as_str(), &[])
            .map_err(|err| DriverError::Query(format!("统计行数失败: {}", err)))?;
        let total: i64 = row.try_get(0).map_err(map_pg_err)?;
        Ok(total.max(0) as u64)
    }

    fn stream(
        &mut self,
        sql: &str,
        batch_size: usize,
    ) -> Result<Box<dyn RowStream + '_>, DriverError> {
        validate_sql(sql)?;
        tracing::debug!(sql = %sql, batch_size);

        // portal 只能存在于事务内，按批次从服务端游标拉取
        let mut transaction = self
            .client
            .build_transaction()
            .read_only(true)
            .start()
            .map_err(|err| DriverError::Query(format!("开启事务失败: {}", err)))?;
        let portal = transaction
            .bind(sql, &[])
            .map_err(|err| DriverError::Query(format!("执行查询失败: {}", err)))?;

        Ok(Box::new(PostgresRowStream {
            transaction,
            portal,
            batch_size: i32::try_from(batch_size.max(1)).unwrap_or(i32::MAX),
            done: false,
        }))
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.client
            .close()
            .map_err(|err| DriverError::Connect(format!("关闭连接失败: {}", err)))
    }
}

/// drop 时事务回滚，portal 随之关闭
struct PostgresRowStream<'a> {
    transaction: Transaction<'a>,
    portal: Portal,
    batch_size: i32,
    done: bool,
}

impl RowStream for PostgresRowStream<'_> {
    fn next_batch(&mut self) -> Result<Option<Vec<Row>>, DriverError> {
        if self.done {
            return Ok(None);
        }

        let rows = self
            .transaction
            .query_portal(&self.portal, self.batch_size)
            .map_err(|err| DriverError::Query(format!("读取结果失败: {}", err)))?;
        if (rows.len() as i32) < self.batch_size {
            self.done = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                record.push(parse_value(row, idx)?);
            }
            records.push(record);
        }
        Ok(Some(records))
    }
}

fn open_conn(config: &DataSourceConfig) -> Result<Client, DriverError> {
    require_field(&config.host, "host")?;
    require_field(&config.username, "username")?;

    // 客户端编码由驱动固定为 UTF8
    let mut pg_config = Config::new();
    pg_config.host(config.host.trim());
    pg_config.port(config.port_or_default());
    pg_config.user(config.username.trim());
    pg_config.password(config.password.as_str());
    if !config.database.trim().is_empty() {
        pg_config.dbname(config.database.trim());
    }
    pg_config.application_name("xlsql");

    tracing::debug!("连接 PostgreSQL: {}", config.endpoint());
    pg_config
        .connect(NoTls)
        .map_err(|err| DriverError::Connect(err.to_string()))
}

fn parse_value(
    row: &postgres::Row,
    idx: usize,
) -> Result<Cell, DriverError> {
    let column = row
        .columns()
        .get(idx)
        .ok_or_else(|| DriverError::Query(format!("列索引越界: {}", idx)))?;
    let ty = column.type_();

    let cell = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map_err(map_pg_err)?.map(Cell::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map_err(map_pg_err)?
            .map(|v| Cell::Int(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map_err(map_pg_err)?
            .map(|v| Cell::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map_err(map_pg_err)?.map(Cell::Int),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)
            .map_err(map_pg_err)?
            .map(|v| Cell::Int(v.into())),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map_err(map_pg_err)?
            .map(|v| Cell::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map_err(map_pg_err)?.map(Cell::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<Numeric>>(idx)
            .map_err(map_pg_err)?
            .map(Numeric::into_cell),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .map_err(map_pg_err)?
            .map(|v| Cell::Text(v.format("%Y-%m-%d").to_string())),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .map_err(map_pg_err)?
            .map(|v| Cell::Text(v.format("%H:%M:%S%.f").to_string())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .map_err(map_pg_err)?
            .map(|v| Cell::Text(v.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map_err(map_pg_err)?
            .map(|v| Cell::Text(v.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .map_err(map_pg_err)?
            .map(|v| Cell::Text(v.to_string())),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .map_err(map_pg_err)?
            .map(|v| Cell::Text(v.to_string())),
        _ if <String as FromSql>::accepts(ty) => row.try_get::<_, Option<String>>(idx).map_err(map_pg_err)?.map(Cell::Text),
        _ => {
            tracing::warn!("PostgreSQL: 不支持导出的字段类型 {}", ty.name());
            Some(Cell::Text(format!("<{}>", ty.name())))
        }
    };
    Ok(cell.unwrap_or(Cell::Null))
}

fn map_pg_err(err: PostgresError) -> DriverError {
    DriverError::Query(format!("PostgreSQL 解析字段失败: {}", err))
}

/// NUMERIC 的二进制格式：ndigits、weight、sign、dscale 后跟若干 base-10000 数位
struct Numeric(String);

impl Numeric {
    fn into_cell(self) -> Cell {
        match self.0.parse::<f64>() {
            Ok(number) if number.is_finite() => Cell::Float(number),
            _ => Cell::Text(self.0),
        }
    }
}

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn Error + Sync + Send>> {
        decode_numeric(raw).map(Numeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn decode_numeric(raw: &[u8]) -> Result<String, Box<dyn Error + Sync + Send>> {
    let word = |pos: usize| u16::from_be_bytes([raw[pos], raw[pos + 1]]);

    if raw.len() < 8 {
        return Err("numeric 数据长度不足".into());
    }
    let ndigits = word(0) as usize;
    let weight = word(2) as i16 as i32;
    let sign = word(4);
    let dscale = word(6) as usize;
    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric 数据长度不足".into());
    }

    match sign {
        0x0000 | 0x4000 => {}
        0xC000 => return Ok("NaN".into()),
        0xD000 => return Ok("Infinity".into()),
        0xF000 => return Ok("-Infinity".into()),
        other => return Err(format!("numeric 符号位非法: {:#06x}", other).into()),
    }

    let digits: Vec<u16> = (0..ndigits).map(|i| word(8 + i * 2)).collect();
    let digit = |i: i32| {
        if i < 0 {
            0
        } else {
            digits.get(i as usize).copied().unwrap_or(0)
        }
    };

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                write!(text, "{}", digit(i))?;
            } else {
                write!(text, "{:04}", digit(i))?;
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while fraction.len() < dscale {
            write!(fraction, "{:04}", digit(i))?;
            i += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(
        weight: i16,
        sign: u16,
        dscale: u16,
        digits: &[u16],
    ) -> Vec<u8> {
        let mut raw = vec![];
        raw.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn numeric_integer_and_fraction() {
        assert_eq!(decode_numeric(&encode(1, 0, 3, &[1, 2345, 6780])).unwrap(), "12345.678");
        assert_eq!(decode_numeric(&encode(0, 0x4000, 2, &[42, 5000])).unwrap(), "-42.50");
        assert_eq!(decode_numeric(&encode(1, 0, 0, &[7])).unwrap(), "70000");
    }

    #[test]
    fn numeric_small_values() {
        assert_eq!(decode_numeric(&encode(-1, 0, 2, &[500])).unwrap(), "0.05");
        assert_eq!(decode_numeric(&encode(-2, 0, 5, &[5000])).unwrap(), "0.00005");
        assert_eq!(decode_numeric(&encode(0, 0, 0, &[])).unwrap(), "0");
    }

    #[test]
    fn numeric_special_values() {
        assert_eq!(decode_numeric(&encode(0, 0xC000, 0, &[])).unwrap(), "NaN");
        assert!(decode_numeric(&[0, 1]).is_err());
        assert!(decode_numeric(&encode(0, 0, 0, &[1])[..9]).is_err());

        assert_eq!(Numeric("12.5".into()).into_cell(), Cell::Float(12.5));
        assert_eq!(Numeric("NaN".into()).into_cell(), Cell::Text("NaN".into()));
    }
}
