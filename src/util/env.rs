//! Deserialization implementation largely based on the [`envy`] crate.
//!
//! This implementation specifically allows `rename`-type derive macros and struct-level
//! defaults on the target struct.
//!
//! [`envy`]: https://github.com/softprops/envy

use std::iter::{IntoIterator, empty};
use std::sync::LazyLock;
use std::time::Duration;

use serde::Deserialize;
use serde::de::value::{MapDeserializer, SeqDeserializer};
use serde::de::{self, IntoDeserializer};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::constants;

static ENV_VARS: LazyLock<OnceCell<Env>> = LazyLock::new(OnceCell::new);

/// Process-wide configuration, read from the environment (and `.env`) on first use
pub async fn env() -> EnvResult<&'static Env> {
    ENV_VARS.get_or_try_init(|| async { Env::new() }).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct Env {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub server_api_port: u16,
    pub internal_token: Option<String>,
    pub provider_signing_secret: Option<String>,
    pub cors_allow_origins: String,
    pub round_duration_secs: u64,
    pub scoring_base_points: i64,
    pub scheduler_tick_ms: u64,
    pub leaderboard_refresh_secs: u64,
    pub storage_retry_attempts: u32,
    pub scoring_workers: usize,
    pub event_queue_capacity: usize,
    pub api_rate_limit: usize,
    pub max_body_bytes: usize,
    pub log_format: LogFormat,
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub api_service_name: String,
    pub api_tracer_name: String,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 20,
            server_api_port: 3000,
            internal_token: None,
            provider_signing_secret: None,
            cors_allow_origins: String::from("*"),
            round_duration_secs: constants::ROUND_SECONDS,
            scoring_base_points: constants::BASE_POINTS,
            scheduler_tick_ms: 1000,
            leaderboard_refresh_secs: 0,
            storage_retry_attempts: 3,
            scoring_workers: 4,
            event_queue_capacity: 1024,
            api_rate_limit: 0,
            max_body_bytes: 64 * 1024,
            log_format: LogFormat::Pretty,
            otel_exporter_otlp_endpoint: None,
            api_service_name: String::from("livepulse-server"),
            api_tracer_name: String::from("livepulse-tracer"),
        }
    }
}

impl Env {
    pub fn new() -> EnvResult<Self> {
        Ok(from_env::<Env>()?)
    }

    pub fn round_duration(&self) -> Duration {
        Duration::from_secs(self.round_duration_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(10))
    }

    /// `None` disables the periodic rebuild
    pub fn leaderboard_refresh(&self) -> Option<Duration> {
        (self.leaderboard_refresh_secs > 0)
            .then(|| Duration::from_secs(self.leaderboard_refresh_secs))
    }

    pub fn database_url(&self) -> Option<&str> {
        non_empty(&self.database_url)
    }

    pub fn internal_token(&self) -> Option<&str> {
        non_empty(&self.internal_token)
    }

    pub fn provider_signing_secret(&self) -> Option<&str> {
        non_empty(&self.provider_signing_secret)
    }

    pub fn otel_endpoint(&self) -> Option<&str> {
        non_empty(&self.otel_exporter_otlp_endpoint)
    }
}

// an exported-but-empty variable counts as unset
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

// ---
//  Deserializer implementation
// ---

struct Val(String, String);
struct Varname(String);

struct Deserializer<'de, Iter: Iterator<Item = (String, String)>> {
    inner: MapDeserializer<'de, Vars<Iter>, EnvDeserializeError>,
}

struct Vars<Iter>
where
    Iter: IntoIterator<Item = (String, String)>,
{
    inner: Iter,
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Val {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Varname {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl<Iter: Iterator<Item = (String, String)>> Iterator for Vars<Iter> {
    type Item = (Varname, Val);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(k, v)| (Varname(k.clone()), Val(k, v)))
    }
}

macro_rules! forward_parsed_vals {
    ($($ty:ident => $method:ident,)*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, EnvDeserializeError>
            where
                V: de::Visitor<'de>
            {
                match self.1.trim().parse::<$ty>() {
                    Ok(val) => val.into_deserializer().$method(visitor),
                    Err(e) => Err(serde::de::Error::custom(format_args!(
                        "{}: while parsing '{}' (variable: {})",
                        e, self.1, self.0
                    )))
                }
            }
        )*
    };
}

impl<'de> serde::de::Deserializer<'de> for Val {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.1.into_deserializer().deserialize_any(visitor)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.1.is_empty() {
            SeqDeserializer::new(empty::<Val>()).deserialize_seq(visitor)
        } else {
            let values = self
                .1
                .split(',')
                .map(|v| Val(self.0.clone(), v.trim().to_owned()));
            SeqDeserializer::new(values).deserialize_seq(visitor)
        }
    }

    fn deserialize_newtype_struct<V>(
        self,
        _: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_enum(self.1.trim().to_ascii_lowercase().into_deserializer())
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_some(self)
    }

    forward_parsed_vals! {
        bool => deserialize_bool,
        u8 => deserialize_u8,
        u16 => deserialize_u16,
        u32 => deserialize_u32,
        u64 => deserialize_u64,
        i8 => deserialize_i8,
        i16 => deserialize_i16,
        i32 => deserialize_i32,
        i64 => deserialize_i64,
        f32 => deserialize_f32,
        f64 => deserialize_f64,
    }

    serde::forward_to_deserialize_any! {
        char str string unit bytes byte_buf map
        unit_struct tuple_struct identifier tuple
        ignored_any
        struct
    }
}

impl<'de> serde::de::Deserializer<'de> for Varname {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.0.into_deserializer().deserialize_any(visitor)
    }

    #[inline]
    fn deserialize_newtype_struct<V>(
        self,
        _: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf map
        unit_struct tuple_struct identifier tuple ignored_any
        bool u8 u16 u32 u64 i8 i16 i32 i64 f32 f64 enum struct
    }
}

impl<'de, Iter: Iterator<Item = (String, String)>> Deserializer<'de, Iter> {
    fn new(vars: Iter) -> Self {
        Deserializer {
            inner: MapDeserializer::new(Vars { inner: vars }),
        }
    }
}

impl<'de, Iter: Iterator<Item = (String, String)>> serde::de::Deserializer<'de>
    for Deserializer<'de, Iter>
{
    type Error = EnvDeserializeError;
    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_map(visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_map(self.inner)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf
        newtype_struct unit_struct tuple_struct identifier
        tuple ignored_any bool u8 u16 u32 u64 i8 i16 i32 i64
        f32 f64 enum struct
    }
}

/// Reads `.env` (if present) merged with the process environment
pub fn from_env<T>() -> Result<T, EnvDeserializeError>
where
    T: serde::de::DeserializeOwned,
{
    from_iter(dotenvy::vars())
}

pub fn from_iter<Iter, T>(iter: Iter) -> Result<T, EnvDeserializeError>
where
    T: serde::de::DeserializeOwned,
    Iter: IntoIterator<Item = (String, String)>,
{
    T::deserialize(Deserializer::new(iter.into_iter()))
}

impl serde::de::Error for EnvDeserializeError {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        EnvDeserializeError::Custom(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        EnvDeserializeError::MissingValue(field.into())
    }
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error(transparent)]
    Dotenvy(#[from] dotenvy::Error),

    #[error(transparent)]
    DeserializationError(#[from] EnvDeserializeError),
}

#[derive(Debug, Error)]
pub enum EnvDeserializeError {
    #[error("env deserialization error: {0}")]
    Custom(String),

    #[error("missing environment variable: {0}")]
    MissingValue(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_unset() {
        let env: Env = from_iter(vars(&[("PATH", "/usr/bin")])).unwrap();

        assert_eq!(env.server_api_port, 3000);
        assert_eq!(env.round_duration(), Duration::from_secs(180));
        assert_eq!(env.scoring_base_points, 10);
        assert_eq!(env.storage_retry_attempts, 3);
        assert_eq!(env.max_body_bytes, 65536);
        assert_eq!(env.log_format, LogFormat::Pretty);
        assert!(env.database_url().is_none());
        assert!(env.leaderboard_refresh().is_none());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let env: Env = from_iter(vars(&[
            ("DATABASE_URL", "postgres://localhost/livepulse"),
            ("SERVER_API_PORT", "8080"),
            ("ROUND_DURATION_SECS", "90"),
            ("LEADERBOARD_REFRESH_SECS", "30"),
            ("SCORING_WORKERS", "8"),
            ("LOG_FORMAT", "JSON"),
            ("INTERNAL_TOKEN", "  "),
        ]))
        .unwrap();

        assert_eq!(env.database_url(), Some("postgres://localhost/livepulse"));
        assert_eq!(env.server_api_port, 8080);
        assert_eq!(env.round_duration(), Duration::from_secs(90));
        assert_eq!(env.leaderboard_refresh(), Some(Duration::from_secs(30)));
        assert_eq!(env.scoring_workers, 8);
        assert_eq!(env.log_format, LogFormat::Json);
        assert!(env.internal_token().is_none());
    }

    #[test]
    fn test_unparseable_value_names_variable() {
        let err = from_iter::<_, Env>(vars(&[("SERVER_API_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("SERVER_API_PORT"));
    }
}
