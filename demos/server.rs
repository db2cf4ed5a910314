use std::io::Read;

use anyhow::Context;
use ember_http::{FnHandler, Server, ServerContext};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut server = Server::builder()
        .endpoint("127.0.0.1:8080".parse().unwrap())
        .handler(FnHandler(|ctx: &mut ServerContext<'_>| {
            let path = ctx.request().url().path().to_string();
            let who = ctx.param("name").unwrap_or("world").to_string();

            let mut upload_note = String::new();
            if let Some(body) = ctx.body() {
                let mut content = String::new();
                body.read_to_string(&mut content)?;
                upload_note = format!("<p>received {} body bytes</p>", content.len());
            }

            let response = ctx.response();
            response.write_str(&format!("<h1>hello, {who}</h1><p>path: {path}</p>{upload_note}"));
            Ok(())
        }))
        .on_state_changed(|state| info!(?state, "server state changed"))
        .build()
        .context("building server")?;

    server.start().await.context("starting server")?;
    info!(endpoint = %server.bound_addr().unwrap(), "listening, ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    server.stop().await.context("stopping server")?;
    Ok(())
}
