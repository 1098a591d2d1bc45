//! The `sql` adaptor: the first column of every row a PostgreSQL query returns becomes an item.

use std::{collections::BTreeMap, str::FromStr, time::Duration};

use snafu::{OptionExt, ResultExt};
use sqlx::{
    Connection, Row,
    postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode},
};
use url::Url;

use super::{
    ConnectSnafu, ConnectTimeoutSnafu, DecodeColumnSnafu, InvalidConnectionStringSnafu,
    ParseConnectOptionsSnafu, QuerySnafu, Result, resolve_utf8_secret,
};
use crate::{crd::list_source::SqlSourceSpec, secret::SecretResolver};

pub(super) async fn resolve(
    config: &SqlSourceSpec,
    namespace: &str,
    secrets: &dyn SecretResolver,
    connect_timeout: Duration,
) -> Result<Vec<String>> {
    let password = match &config.auth {
        Some(auth) => Some(
            resolve_utf8_secret(secrets, namespace, &auth.secret_ref, auth.password_key()).await?,
        ),
        None => None,
    };
    let options = connect_options(&config.connection_string, password.as_deref())?;

    let mut connection = tokio::time::timeout(connect_timeout, PgConnection::connect_with(&options))
        .await
        .ok()
        .context(ConnectTimeoutSnafu {
            timeout: connect_timeout,
        })?
        .context(ConnectSnafu)?;

    let rows = sqlx::query(&config.query)
        .fetch_all(&mut connection)
        .await
        .context(QuerySnafu)?;
    let items = rows
        .iter()
        .enumerate()
        .map(|(row, values)| first_column(values).context(DecodeColumnSnafu { row }))
        .collect::<Result<Vec<_>>>()?;

    if let Err(error) = connection.close().await {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "failed to close database connection"
        );
    }
    tracing::debug!(item.count = items.len(), "resolved items from database");
    Ok(items)
}

/// Reads the first column of `row` as text. `NULL` becomes an empty item.
fn first_column(row: &PgRow) -> Result<String, sqlx::Error> {
    fn stringified<T: ToString>(value: Option<T>) -> String {
        value.map(|v| v.to_string()).unwrap_or_default()
    }

    if let Ok(value) = row.try_get::<Option<String>, _>(0) {
        return Ok(value.unwrap_or_default());
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(0) {
        return Ok(stringified(value));
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(0) {
        return Ok(stringified(value));
    }
    if let Ok(value) = row.try_get::<Option<i16>, _>(0) {
        return Ok(stringified(value));
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(0) {
        return Ok(stringified(value));
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(0) {
        return Ok(stringified(value));
    }
    // Reports the mismatch against the text type, the most useful hint for users
    row.try_get::<Option<String>, _>(0)
        .map(Option::unwrap_or_default)
}

fn is_url(connection_string: &str) -> bool {
    connection_string.starts_with("postgres://") || connection_string.starts_with("postgresql://")
}

/// Builds connection options from a URL or libpq `key=value` connection string,
/// replacing its password with `password` if one is given.
pub fn connect_options(connection_string: &str, password: Option<&str>) -> Result<PgConnectOptions> {
    let connection_string = connection_string.trim();
    if is_url(connection_string) {
        let url = url_with_password(connection_string, password)?;
        PgConnectOptions::from_str(url.as_str()).context(ParseConnectOptionsSnafu)
    } else {
        let mut params = parse_key_values(connection_string)?;
        if let Some(password) = password {
            params.insert("password".to_string(), password.to_string());
        }
        options_from_key_values(&params)
    }
}

fn url_with_password(connection_string: &str, password: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(connection_string)
        .ok()
        .context(InvalidConnectionStringSnafu {
            reason: "malformed URL",
        })?;
    if let Some(password) = password {
        url.set_password(Some(password))
            .ok()
            .context(InvalidConnectionStringSnafu {
                reason: "URL cannot carry a password",
            })?;
    }
    Ok(url)
}

/// Parses a libpq style `key=value` connection string.
///
/// Values may be single quoted, inside quotes `\'` and `\\` escape a quote and a backslash.
fn parse_key_values(input: &str) -> Result<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    let mut chars = input.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return InvalidConnectionStringSnafu {
                reason: format!("expected \"=\" after {key:?}"),
            }
            .fail();
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some('\\') => value.extend(chars.next()),
                    Some(c) => value.push(c),
                    None => {
                        return InvalidConnectionStringSnafu {
                            reason: format!("unterminated quoted value of {key:?}"),
                        }
                        .fail();
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }
        params.insert(key, value);
    }
    Ok(params)
}

fn options_from_key_values(params: &BTreeMap<String, String>) -> Result<PgConnectOptions> {
    let mut options = PgConnectOptions::new();
    for (key, value) in params {
        options = match key.as_str() {
            "host" | "hostaddr" => options.host(value),
            "port" => options.port(value.parse().ok().context(InvalidConnectionStringSnafu {
                reason: format!("invalid port {value:?}"),
            })?),
            "user" => options.username(value),
            "password" => options.password(value),
            "dbname" => options.database(value),
            "sslmode" => options.ssl_mode(PgSslMode::from_str(value).ok().context(
                InvalidConnectionStringSnafu {
                    reason: format!("invalid sslmode {value:?}"),
                },
            )?),
            "sslrootcert" => options.ssl_root_cert(value.as_str()),
            "application_name" => options.application_name(value),
            _ => {
                tracing::debug!(key, "ignoring unsupported connection parameter");
                options
            }
        };
    }
    Ok(options)
}
