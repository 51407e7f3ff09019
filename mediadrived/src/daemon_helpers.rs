fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_opt_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_dimensions(width: &str, height: &str) -> Option<Dimensions> {
    let (w, h) = (read_opt_u64_env(width), read_opt_u64_env(height));
    let dimensions = Dimensions::from_parts(w, h);
    if dimensions.is_none() && (w.is_some() || h.is_some()) {
        warn!(width, height, "incomplete resize target, storing originals");
    }
    dimensions
}

fn parse_bind_addr(bind: Option<String>, port: Option<String>) -> anyhow::Result<SocketAddr> {
    let raw = match (bind, port) {
        (Some(bind), _) => bind,
        (None, Some(port)) => format!("0.0.0.0:{port}"),
        (None, None) => DEFAULT_BIND_ADDR.to_string(),
    };
    raw.parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address {raw}"))
}

/// Starts a cycle on every tick. A tick that lands while a cycle is still running
/// spawns a cycle the reconciler refuses.
async fn reconcile_loop(reconciler: Arc<Reconciler>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let reconciler = Arc::clone(&reconciler);
                cycles.spawn(async move { reconciler.run_cycle().await });
            }
            Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                if let Err(err) = joined {
                    warn!(error = %err, "reconciliation cycle panicked");
                }
            }
        }
    }
    cycles.abort_all();
}

async fn keepalive_loop(url: String, every: Duration, shutdown: CancellationToken) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the ping starts one period in.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = keepalive_once(&client, &url).await {
                    warn!(%url, error = %err, "keepalive ping failed");
                }
            }
        }
    }
}

async fn keepalive_once(client: &reqwest::Client, url: &str) -> anyhow::Result<()> {
    let status = client
        .get(url)
        .send()
        .await
        .context("keepalive request failed")?
        .status();
    anyhow::ensure!(status.is_success(), "keepalive answered {status}");
    debug!(%url, %status, "keepalive ok");
    Ok(())
}
