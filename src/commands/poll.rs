use crate::db::Database;
use crate::models::Poll;
use log::info;

const USAGE: &str = "usage: polls create <title> <comma-separated options> [api key] | polls list | polls show <id> | polls delete <id>";

/// Splits the comma-separated option list, dropping blanks.
pub fn parse_options(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|option| option.trim())
        .filter(|option| !option.is_empty())
        .map(|option| option.to_string())
        .collect()
}

pub async fn handle_poll_command(
    database: &Database,
    args: &[String],
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let arg = |i: usize| args.get(i).map(String::as_str);

    match (arg(0), arg(1), arg(2)) {
        (Some("create"), Some(title), Some(options)) => {
            let poll = Poll::new(title.to_string(), parse_options(options), arg(3).map(str::to_string));
            database.create_poll(&poll).await?;
            info!("Created poll {} with {} option(s)", poll.id, poll.options.len());
            Ok(serde_json::to_string_pretty(&poll)?)
        }
        (Some("list"), None, _) => {
            let polls = database.list_polls().await?;
            Ok(serde_json::to_string_pretty(&polls)?)
        }
        (Some("show"), Some(poll_id), None) => {
            let poll = database.get_poll(poll_id).await?;
            Ok(serde_json::to_string_pretty(&poll)?)
        }
        (Some("delete"), Some(poll_id), None) => {
            database.delete_poll(poll_id).await?;
            info!("Deleted poll {}", poll_id);
            Ok(format!("deleted {}", poll_id))
        }
        _ => Err(USAGE.into()),
    }
}
