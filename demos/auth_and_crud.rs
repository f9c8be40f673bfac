use std::error::Error;

use pocketbase_sdk::{FilePart, FilterParam, PocketBase, RequestOptions};
use serde_json::json;

fn main() -> Result<(), Box<dyn Error>> {
    let base_url = "http://127.0.0.1:8090".to_string();
    let identity = "REPLACE_WITH_EMAIL".to_string();
    let password = "REPLACE_WITH_PASSWORD".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = PocketBase::new(base_url)?;
        let auth = client
            .collection("users")
            .auth_with_password(&identity, &password, &RequestOptions::new())
            .await?;
        println!("authenticated record_id={}", auth.record.id());

        let posts = client.collection("posts");
        let created = posts
            .create(
                json!({"title": "hello", "author": auth.record.id()}),
                vec![FilePart::new("cover", "cover.txt", b"cover".to_vec()).with_mime("text/plain")],
                &RequestOptions::new(),
            )
            .await?;
        println!("created post_id={}", created.id());

        let filter = PocketBase::filter(
            "author = {:author} && title ~ {:title}",
            [
                ("author", FilterParam::from(auth.record.id())),
                ("title", FilterParam::from("hel")),
            ],
        );
        let page = posts
            .get_list(1, 20, false, &RequestOptions::new().filter(filter).sort("-created"))
            .await?;
        println!("page={} total_items={}", page.page, page.total_items);

        posts
            .update(created.id(), json!({"title": "hello again"}), Vec::new(), &RequestOptions::new())
            .await?;
        posts.delete(created.id(), &RequestOptions::new()).await?;

        client.auth_store().clear();
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
