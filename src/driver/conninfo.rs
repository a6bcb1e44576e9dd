//! libpq `keyword=value` connection strings.
//!
//! ```text
//! host=db.internal port=5432 dbname=app user=app password='s3cr3t pass'
//! ```
//!
//! Values may be single-quoted; inside quotes `\'` and `\\` are escapes.
//! Missing settings fall back to the usual `PG*` environment variables.

use std::time::Duration;

use super::DriverError;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5432;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parsed connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub application_name: Option<String>,
    pub client_encoding: Option<String>,
    pub connect_timeout: Duration,
}

impl ConnInfo {
    /// Parses `conninfo`, filling gaps from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Conninfo`] for syntax errors, unknown keywords,
    /// bad numbers, or an `sslmode` that demands TLS.
    ///
    /// # Examples
    ///
    /// ```
    /// use rttp_pgsql::driver::ConnInfo;
    ///
    /// let info = ConnInfo::parse("host=db port=6543 user=app dbname=shop").unwrap();
    /// assert_eq!(info.host, "db");
    /// assert_eq!(info.port, 6543);
    /// assert_eq!(info.dbname, "shop");
    /// ```
    pub fn parse(conninfo: &str) -> Result<Self, DriverError> {
        Self::parse_with_env(conninfo, |name| std::env::var(name).ok())
    }

    fn parse_with_env(
        conninfo: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, DriverError> {
        let mut host = None;
        let mut port = None;
        let mut user = None;
        let mut password = None;
        let mut dbname = None;
        let mut application_name = None;
        let mut client_encoding = None;
        let mut connect_timeout = None;

        for (key, value) in pairs(conninfo)? {
            match key.as_str() {
                "host" | "hostaddr" => host = Some(value),
                "port" => port = Some(parse_number::<u16>("port", &value)?),
                "user" => user = Some(value),
                "password" => password = Some(value),
                "dbname" => dbname = Some(value),
                "application_name" => application_name = Some(value),
                "client_encoding" => client_encoding = Some(value),
                "connect_timeout" => {
                    let secs = parse_number::<u64>("connect_timeout", &value)?;
                    // libpq treats 0 as "wait forever"; cap it at the default.
                    connect_timeout = Some(if secs == 0 {
                        DEFAULT_CONNECT_TIMEOUT
                    } else {
                        Duration::from_secs(secs)
                    });
                }
                "sslmode" => match value.as_str() {
                    "disable" | "allow" | "prefer" => {}
                    other => {
                        return Err(DriverError::Conninfo(format!(
                            "sslmode \"{other}\" requires TLS, which is not supported"
                        )));
                    }
                },
                other => {
                    return Err(DriverError::Conninfo(format!(
                        "unknown keyword \"{other}\""
                    )));
                }
            }
        }

        let host = host
            .or_else(|| env("PGHOST"))
            .unwrap_or_else(|| DEFAULT_HOST.to_owned());
        let port = match port {
            Some(port) => port,
            None => match env("PGPORT") {
                Some(value) => parse_number("PGPORT", &value)?,
                None => DEFAULT_PORT,
            },
        };
        let user = user
            .or_else(|| env("PGUSER"))
            .or_else(|| env("USER"))
            .unwrap_or_else(|| "postgres".to_owned());
        let password = password.or_else(|| env("PGPASSWORD"));
        let dbname = dbname
            .or_else(|| env("PGDATABASE"))
            .unwrap_or_else(|| user.clone());
        let application_name = application_name.or_else(|| env("PGAPPNAME"));

        Ok(Self {
            host,
            port,
            user,
            password,
            dbname,
            application_name,
            client_encoding,
            connect_timeout: connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        })
    }

    /// `host:port` for socket resolution.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parameters sent in the StartupMessage.
    pub fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("user".to_owned(), self.user.clone()),
            ("database".to_owned(), self.dbname.clone()),
        ];
        if let Some(name) = &self.application_name {
            params.push(("application_name".to_owned(), name.clone()));
        }
        if let Some(encoding) = &self.client_encoding {
            params.push(("client_encoding".to_owned(), encoding.clone()));
        }
        params
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, DriverError> {
    value
        .parse()
        .map_err(|_| DriverError::Conninfo(format!("invalid value for \"{key}\": \"{value}\"")))
}

// Splits a conninfo string into keyword/value pairs.
fn pairs(input: &str) -> Result<Vec<(String, String)>, DriverError> {
    let mut out = Vec::new();
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
            return Err(DriverError::Conninfo(format!(
                "missing \"=\" after \"{key}\""
            )));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => break,
                    },
                    Some('\'') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(DriverError::Conninfo(
                            "unterminated quoted string".to_owned(),
                        ));
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                } else {
                    value.push(c);
                }
            }
        }

        out.push((key, value));
    }

    Ok(out)
}
