//! Runs a handful of concurrent queries through a two-connection pool.
//!
//! ```text
//! RTTP_PGSQL_CONNINFO="host=localhost user=postgres dbname=postgres" \
//! RUST_LOG=rttp_pgsql=debug cargo run --example pg_query
//! ```

use rttp_pgsql::config::PgConfig;
use rttp_pgsql::database::{SimpleContext, SimpleHooks};
use rttp_pgsql::driver::{PgConnector, QueryResult};
use rttp_pgsql::worker::Worker;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Sleeper {
    id: u32,
    rows: Vec<String>,
}

impl SimpleHooks for Sleeper {
    fn init(&mut self, cx: &mut SimpleContext) -> bool {
        cx.set_query(format!(
            "SELECT {id} AS id, pg_sleep(0.2), now()::text",
            id = self.id
        ));
        true
    }

    fn result(&mut self, _cx: &mut SimpleContext, rows: &QueryResult) {
        for row in 0..rows.ntuples() {
            let id = rows.value(row, 0).unwrap_or("NULL");
            let at = rows.value(row, 2).unwrap_or("NULL");
            self.rows.push(format!("{id} @ {at}"));
        }
    }

    fn done(&mut self, cx: &mut SimpleContext) {
        info!(request = %cx.request(), status = %cx.status(), "query {} done", self.id);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = PgConfig::from_env()?;
    let (worker, handle) = Worker::new(config, PgConnector)?;

    let client = async move {
        let mut pending = Vec::new();
        for id in 1..=5 {
            pending.push(handle.submit(Sleeper {
                id,
                rows: Vec::new(),
            })?);
        }
        let mut completed = Vec::new();
        for submitted in pending {
            completed.push(submitted.wait().await?);
        }
        Ok::<_, rttp_pgsql::WorkerError>(completed)
    };

    let ((), completed) = tokio::join!(worker.run(), client);
    for completion in completed? {
        match completion.error {
            Some(error) => println!("{}: {}", completion.status, error.trim_end()),
            None => println!("{}: {:?}", completion.status, completion.hooks.rows),
        }
    }
    Ok(())
}
