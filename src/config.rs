//! Environment-variable configuration, optionally bootstrapped from a
//! secrets store keyed by `BIOINDEX_ENVIRONMENT` (§6). Mirrors the way the
//! teacher loads its `conf.toml` plus environment in `server::rest::run`,
//! generalized to plain env vars since BioIndex has no on-disk database
//! config file of its own.

use byte_unit::Byte;

/// Hook for bootstrapping secrets (e.g. DB password, S3 creds) from an
/// external secrets store before the rest of `Config` is read from the
/// environment. Defaults to a no-op so tests and local runs work without one.
#[async_trait::async_trait]
pub trait SecretsBootstrap: Send + Sync {
    async fn bootstrap(&self, environment: &str) -> anyhow::Result<()>;
}

pub struct NoopSecretsBootstrap;

#[async_trait::async_trait]
impl SecretsBootstrap for NoopSecretsBootstrap {
    async fn bootstrap(&self, _environment: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Process-wide configuration, read once at startup from environment
/// variables per the table in spec §6.
#[derive(Debug, Clone)]
pub struct Config {
    pub s3_bucket: String,
    pub rds_instance: String,
    pub bio_schema: String,
    pub portal_schema: Option<String>,
    pub response_limit: u64,
    pub response_limit_max: u64,
    pub match_limit: usize,
    pub script_timeout_secs: u64,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_byte_size(raw: &str) -> anyhow::Result<u64> {
    Byte::from_str(raw)
        .map(|b| b.get_bytes() as u64)
        .map_err(|e| anyhow::anyhow!("invalid byte size {:?}: {}", raw, e))
}

impl Config {
    /// Load configuration from the environment, running `bootstrap` first if
    /// `BIOINDEX_ENVIRONMENT` is set.
    pub async fn load(bootstrap: &dyn SecretsBootstrap) -> anyhow::Result<Self> {
        if let Some(environment) = env_var("BIOINDEX_ENVIRONMENT") {
            tracing::debug!("bootstrapping secrets for environment {:?}", &environment);
            bootstrap.bootstrap(&environment).await?;
        }

        let s3_bucket = env_var("BIOINDEX_S3_BUCKET")
            .ok_or_else(|| anyhow::anyhow!("BIOINDEX_S3_BUCKET is required"))?;
        let rds_instance = env_var("BIOINDEX_RDS_INSTANCE")
            .ok_or_else(|| anyhow::anyhow!("BIOINDEX_RDS_INSTANCE is required"))?;
        let bio_schema = env_var("BIOINDEX_BIO_SCHEMA").unwrap_or_else(|| "bio".to_string());
        let portal_schema = env_var("BIOINDEX_PORTAL_SCHEMA").or(Some("portal".to_string()));
        let response_limit = env_var("BIOINDEX_RESPONSE_LIMIT")
            .map(|v| parse_byte_size(&v))
            .transpose()?
            .unwrap_or(1024 * 1024);
        let response_limit_max = env_var("BIOINDEX_RESPONSE_LIMIT_MAX")
            .map(|v| parse_byte_size(&v))
            .transpose()?
            .unwrap_or(100 * 1024 * 1024);
        let match_limit = env_var("BIOINDEX_MATCH_LIMIT")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(100);
        let script_timeout_secs = env_var("BIOINDEX_SCRIPT_TIMEOUT")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(10);

        Ok(Self {
            s3_bucket,
            rds_instance,
            bio_schema,
            portal_schema,
            response_limit,
            response_limit_max,
            match_limit,
            script_timeout_secs,
        })
    }

    /// `mysql://` connection string for the catalog schema, for use with `sqlx`.
    pub fn catalog_url(&self) -> String {
        format!("mysql://{}/{}", self.rds_instance, self.bio_schema)
    }

    /// `mysql://` connection string for the (optional) portal/restrictions schema.
    pub fn portal_url(&self) -> Option<String> {
        self.portal_schema
            .as_ref()
            .map(|schema| format!("mysql://{}/{}", self.rds_instance, schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_byte_size_handles_mib() {
        assert_eq!(parse_byte_size("1 MiB").unwrap(), 1024 * 1024);
        assert_eq!(parse_byte_size("100MiB").unwrap(), 100 * 1024 * 1024);
    }
}
