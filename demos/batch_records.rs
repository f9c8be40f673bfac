use std::error::Error;

use pocketbase_sdk::{PocketBase, RequestOptions};
use serde_json::json;

fn main() -> Result<(), Box<dyn Error>> {
    let base_url = "http://127.0.0.1:8090".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = PocketBase::new(base_url)?;
        let health = client.health().check(&RequestOptions::new()).await?;
        println!("health code={} message={}", health.code, health.message);

        let mut batch = client.create_batch();
        batch
            .collection("posts")
            .create(json!({"title": "first"}), Vec::new(), &RequestOptions::new())
            .upsert(json!({"id": "post0000000001", "title": "second"}), Vec::new(), &RequestOptions::new());
        batch.collection("tags").delete("tag00000000001", &RequestOptions::new());

        for (index, result) in batch.send(&RequestOptions::new()).await?.iter().enumerate() {
            println!("request={index} status={} body={}", result.status, result.body);
        }
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
