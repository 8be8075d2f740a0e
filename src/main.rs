use std::process::ExitCode;
use std::sync::Arc;

use nevermail_search::core::keyring;
use nevermail_search::{AesGcmCipher, SearchConfig, SearchService, UserId};

const USAGE: &str = "usage: nevermail-search <stats|rebuild|delete> <user-id>
       nevermail-search shrink <user-id> <max-bytes>";

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &[String]) -> Result<(), String> {
    let (command, user) = match args {
        [command, user, ..] => (command.as_str(), user),
        _ => return Err(USAGE.to_string()),
    };
    let user_id = UserId::new(user.as_str()).map_err(|e| e.to_string())?;

    let config = SearchConfig::resolve().map_err(|e| e.to_string())?;
    let service = SearchService::new(config);

    let result = match command {
        "stats" => stats(&service, &user_id).await,
        "rebuild" => rebuild(&service, &user_id).await,
        "shrink" => {
            let max_bytes = args
                .get(2)
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| USAGE.to_string())?;
            shrink(&service, &user_id, max_bytes).await
        }
        "delete" => delete(&service, &user_id).await,
        _ => Err(USAGE.to_string()),
    };

    if let Err(e) = service.shutdown().await {
        log::warn!("Search index did not close cleanly: {}", e);
    }
    result
}

async fn stats(service: &SearchService, user_id: &UserId) -> Result<(), String> {
    let stats = service.stats(user_id).await.map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&stats).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

async fn activate(service: &SearchService, user_id: &UserId) -> Result<(), String> {
    let key = keyring::get_or_create_index_key(user_id)?;
    service
        .switch_user(user_id, Arc::new(AesGcmCipher::new(&key)))
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

async fn rebuild(service: &SearchService, user_id: &UserId) -> Result<(), String> {
    activate(service, user_id).await?;
    let cache = service.rebuild_cache().await.map_err(|e| e.to_string())?;
    println!(
        "{} entries cached{}",
        cache.len(),
        if cache.is_partial() { " (partial)" } else { "" }
    );
    Ok(())
}

async fn shrink(service: &SearchService, user_id: &UserId, max_bytes: u64) -> Result<(), String> {
    activate(service, user_id).await?;
    let removed = service.shrink(max_bytes).await.map_err(|e| e.to_string())?;
    println!("{removed} entries removed");
    Ok(())
}

async fn delete(service: &SearchService, user_id: &UserId) -> Result<(), String> {
    let existed = service
        .delete_index(user_id)
        .await
        .map_err(|e| e.to_string())?;
    keyring::delete_index_key(user_id)?;
    if existed {
        println!("Deleted search index of {user_id}");
    } else {
        println!("No search index for {user_id}");
    }
    Ok(())
}
