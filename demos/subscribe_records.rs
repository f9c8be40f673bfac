use std::error::Error;
use std::time::Duration;

use pocketbase_sdk::{PocketBase, SubscribeOptions};
use tokio::sync::mpsc;

fn main() -> Result<(), Box<dyn Error>> {
    let base_url = "http://127.0.0.1:8090".to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = PocketBase::new(base_url)?;
        client.realtime().set_on_disconnect(|keys| {
            println!("realtime disconnected, live topics={keys:?}");
        });

        let posts = client.collection("posts");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = posts
            .subscribe(
                "*",
                SubscribeOptions::new().expand("author"),
                move |event| {
                    let _ = tx.send(event);
                },
            )
            .await?;
        println!("subscribed client_id={}", client.realtime().client_id());

        for _ in 0..5 {
            match tokio::time::timeout(Duration::from_secs(60), rx.recv()).await {
                Ok(Some(event)) => {
                    println!("action={} record_id={}", event.action, event.record.id());
                }
                _ => break,
            }
        }

        subscription.unsubscribe().await?;
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
