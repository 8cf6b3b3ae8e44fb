//! deluge - run the pipeline roles selected by `DELUGE_ROLE`
//!
//! All settings come from `DELUGE_*` environment variables; see
//! `deluge_pipeline::Config::from_env`.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deluge_runtime::run().await
}
