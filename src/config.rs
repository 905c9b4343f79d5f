use log::{info, warn};
use std::{env, fmt::Display, path::PathBuf, str::FromStr};

const COOKIE_KEY_BYTES: usize = 32;

#[derive(Clone)]
pub struct Config {
    pub bind: String,
    /// `None` keeps everything in a temporary database.
    pub db_path: Option<PathBuf>,
    pub cookie_key: Vec<u8>,
    /// Uids allowed to see the admin counters.
    pub admins: Vec<String>,
    pub feed_limit: usize,
}

impl Config {
    pub fn load() -> Self {
        Self {
            bind: try_load("REELGRAPH_BIND", "127.0.0.1:8080"),
            db_path: var("REELGRAPH_DB_PATH").ok().map(PathBuf::from),
            cookie_key: cookie_key(),
            admins: var("REELGRAPH_ADMINS")
                .map(|admins| {
                    admins
                        .split(',')
                        .map(str::trim)
                        .filter(|uid| !uid.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            feed_limit: try_load("REELGRAPH_FEED_LIMIT", "50"),
        }
    }

    pub fn is_admin(&self, uid: &str) -> bool {
        self.admins.iter().any(|admin| admin == uid)
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        info!("Environment variable {} not set", key);
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{} not set, using default: {}", key, default);
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {} value: {}", key, e);
        })
        .expect("Environment misconfigured!")
}

fn cookie_key() -> Vec<u8> {
    match var("REELGRAPH_COOKIE_KEY") {
        Ok(key) if key.len() >= COOKIE_KEY_BYTES => key.into_bytes(),
        Ok(_) => panic!(
            "REELGRAPH_COOKIE_KEY must be at least {} bytes",
            COOKIE_KEY_BYTES
        ),
        Err(_) => {
            warn!("Using an all zero cookie key, sessions are forgeable");
            vec![0u8; COOKIE_KEY_BYTES]
        }
    }
}
