use std::sync::Arc;

use futures_util::future::BoxFuture;
use tablemq::{
    config::Config,
    handler::{MessageContext, MessageHandler},
    receive::ReceiveSettings,
    Transport,
};

struct LogMessages;

impl MessageHandler for LogMessages {
    fn handle<'a>(&'a self, ctx: &'a mut MessageContext<'_, '_>) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(async move {
            let message = ctx.message();
            tracing::info!(
                queue = %ctx.receive_address(),
                message_id = %message.id,
                headers = ?message.headers,
                body_len = message.body.len(),
                "Received message"
            );
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tablemq::init_tracing()?;

    let config = Config::load()?;
    let endpoint = config.endpoint_name().to_owned();

    let transport = Transport::builder()
        .config(config)
        .endpoint_name(endpoint.clone())
        .receivers(vec![ReceiveSettings::new("main", endpoint)])
        .connect()
        .await?;

    if let Some(receiver) = transport.receiver("main") {
        receiver.start(Arc::new(LogMessages)).await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    transport.shutdown().await;

    Ok(())
}
