//! Configuration from the environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// SQLite connection URL
    pub database_url: String,
    /// Root of the published HLS output
    pub chunks_root: PathBuf,
    /// Directory holding untranscoded uploads
    pub upload_dir: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Upper bound on concurrently running encoder processes
    pub max_concurrent_encodes: usize,
    pub max_db_connections: u32,
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: env::var("ADDR").unwrap_or_else(|_| String::from("127.0.0.1")),
            port: env::var("PORT").unwrap_or_else(|_| String::from("3000")),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| String::from("sqlite://rendition.db")),
            chunks_root: env_path("CHUNKS_ROOT", "./chunks"),
            upload_dir: env_path("UPLOAD_DIR", "./uploads"),
            ffmpeg_bin: env_path("FFMPEG_BIN", "ffmpeg"),
            ffprobe_bin: env_path("FFPROBE_BIN", "ffprobe"),
            max_concurrent_encodes: env_parse("MAX_CONCURRENT_ENCODES")
                .unwrap_or_else(default_encode_slots),
            max_db_connections: env_parse("MAX_DB_CONNECTIONS").unwrap_or(5),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn default_encode_slots() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
