// CLI commands for operating the judge
use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use ojudge_common::config::{Config, LanguageRuntime, LanguagesFile};
use ojudge_common::redis::{self as queue_ops, result_channel, Queue};
use ojudge_common::types::{JobRequest, VerdictKind, VerdictPayload};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Load languages configuration
fn load_languages_config(config_path: &Path) -> Result<LanguagesFile> {
    if !config_path.exists() {
        return Ok(LanguagesFile::default());
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", config_path.display()))
}

/// Save languages configuration
fn save_languages_config(config_path: &Path, config: &LanguagesFile) -> Result<()> {
    // Ensure config directory exists
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json_content = serde_json::to_string_pretty(config)
        .context("Failed to serialize languages.json")?;

    fs::write(config_path, json_content + "\n")
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    Ok(())
}

/// Build the queue payload for a submission or test run
fn build_job(
    problem_id: i64,
    language: &str,
    code: String,
    submission: Option<i64>,
    session: Option<String>,
) -> JobRequest {
    // Official submissions never carry a session; test runs always do
    let session_token = match submission {
        Some(_) => None,
        None => Some(session.unwrap_or_else(|| Uuid::new_v4().to_string())),
    };

    JobRequest {
        submitted_id: submission,
        problem_id,
        language: language.to_string(),
        code,
        session_token,
        enqueued_at: Some(Utc::now()),
    }
}

fn print_payload(payload: &VerdictPayload) -> Result<()> {
    let icon = match payload.status {
        VerdictKind::Accepted => "✅",
        VerdictKind::WrongAnswer => "❌",
        VerdictKind::RuntimeError => "💥",
        VerdictKind::TimeLimitExceeded => "⏱️ ",
    };
    println!("{} {}", icon, payload.status);
    for result in &payload.results {
        match result {
            serde_json::Value::String(message) => println!("{}", message),
            other => println!("{}", serde_json::to_string_pretty(other)?),
        }
    }
    Ok(())
}

async fn wait_for_result(
    pubsub: &mut redis::aio::PubSub,
    session: &str,
    timeout_secs: u64,
) -> Result<()> {
    let mut messages = Box::pin(pubsub.on_message());
    let message = tokio::time::timeout(Duration::from_secs(timeout_secs), messages.next())
        .await
        .with_context(|| format!("No result for session {} within {}s", session, timeout_secs))?
        .context("Result channel closed")?;

    let raw: String = message.get_payload()?;
    let payload: VerdictPayload =
        serde_json::from_str(&raw).context("Failed to parse result payload")?;
    print_payload(&payload)
}

/// Enqueue a submission
pub async fn submit(
    problem_id: i64,
    language: &str,
    file: &Path,
    submission: Option<i64>,
    session: Option<String>,
    wait: bool,
    timeout_secs: u64,
) -> Result<()> {
    let code = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if code.trim().is_empty() {
        bail!("{} is empty", file.display());
    }

    let job = build_job(problem_id, language, code, submission, session);
    let queue = Queue::for_job(&job);

    let config = Config::from_env();
    let client = redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;

    // Subscribe before pushing so a fast verdict is not missed
    let mut pubsub = match (&job.session_token, wait) {
        (Some(token), true) => {
            let mut pubsub = client.get_async_pubsub().await?;
            pubsub.subscribe(result_channel(token)).await?;
            Some(pubsub)
        }
        _ => None,
    };

    let mut conn = redis::aio::ConnectionManager::new(client).await?;
    queue_ops::push_job(&mut conn, queue, &job).await?;

    println!("📤 Enqueued on {}", queue);
    match (&job.submitted_id, &job.session_token) {
        (Some(id), _) => println!("  Submission: {}", id),
        (None, Some(token)) => println!("  Session:    {}", token),
        _ => {}
    }

    if wait && job.submitted_id.is_some() {
        println!("\n💡 Official results are written to the store; --wait only applies to test runs");
    }

    if let (Some(pubsub), Some(token)) = (pubsub.as_mut(), &job.session_token) {
        println!("\n⏳ Waiting for result...");
        wait_for_result(pubsub, token, timeout_secs).await?;
    } else if let Some(token) = &job.session_token {
        println!("\n💡 Watch with: ojudge-cli watch --session {}", token);
    }

    Ok(())
}

/// Print the next result published for a session
pub async fn watch(session: &str, timeout_secs: u64) -> Result<()> {
    let config = Config::from_env();
    let client = redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(result_channel(session)).await?;

    println!("👀 Watching session {}...", session);
    wait_for_result(&mut pubsub, session, timeout_secs).await
}

/// Show queue depths
pub async fn stats() -> Result<()> {
    let config = Config::from_env();
    let client = redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;
    let mut conn = redis::aio::ConnectionManager::new(client).await?;

    println!("📊 Queue depths ({})\n", config.redis_url);
    println!("{:<22} {:>10} {:>12}", "Queue", "Pending", "In flight");
    println!("{}", "─".repeat(46));

    for queue in Queue::ALL {
        let (pending, processing) = queue_ops::queue_depth(&mut conn, queue).await?;
        println!("{:<22} {:>10} {:>12}", queue.name(), pending, processing);
    }

    Ok(())
}

/// Build a runtime descriptor with CLI defaults filled in
fn new_runtime(
    name: &str,
    image: &str,
    container_name: Option<&str>,
    command: Option<&str>,
    memory: u32,
    cpu: f32,
) -> Result<LanguageRuntime> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        bail!("Language name must be non-empty and alphanumeric: {:?}", name);
    }
    if image.is_empty() {
        bail!("Image cannot be empty");
    }
    if memory == 0 || cpu <= 0.0 {
        bail!("Memory and CPU limits must be positive");
    }

    Ok(LanguageRuntime {
        name: name.to_ascii_lowercase(),
        image: image.to_string(),
        container_name: container_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_oj", name.to_ascii_lowercase())),
        command: command.unwrap_or(name).to_string(),
        memory_limit_mb: memory,
        cpu_limit: cpu,
    })
}

fn insert_runtime(file: &mut LanguagesFile, runtime: LanguageRuntime) -> Result<()> {
    if file
        .languages
        .iter()
        .any(|l| l.name.eq_ignore_ascii_case(&runtime.name))
    {
        bail!("Language '{}' already exists in config", runtime.name);
    }
    file.languages.push(runtime);
    Ok(())
}

/// Add a language runtime
pub fn add_language(
    name: &str,
    image: &str,
    container_name: Option<&str>,
    command: Option<&str>,
    memory: u32,
    cpu: f32,
) -> Result<()> {
    println!("🚀 Adding language: {}", name);

    let config_path = Config::from_env().languages_config;
    let runtime = new_runtime(name, image, container_name, command, memory, cpu)?;
    let image_ref = runtime.image_ref();

    let mut languages = load_languages_config(&config_path)?;
    insert_runtime(&mut languages, runtime)?;

    println!("📝 Updating {}...", config_path.display());
    save_languages_config(&config_path, &languages)?;

    println!("✅ Language '{}' added successfully!", name);
    println!("\n📋 Next steps:");
    println!("  1. Make sure the image is present: docker image inspect {}", image_ref);
    println!("  2. Restart the worker to pick up the new runtime");

    Ok(())
}

/// Remove a language runtime
pub fn remove_language(name: &str, yes: bool) -> Result<()> {
    println!("🗑️  Removing language: {}", name);

    let config_path = Config::from_env().languages_config;
    let mut languages = load_languages_config(&config_path)?;

    let index = languages
        .languages
        .iter()
        .position(|l| l.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow::anyhow!("Language '{}' not found in config", name))?;

    // Confirm deletion
    if !yes {
        print!("⚠️  This will remove the '{}' entry from {}\n", name, config_path.display());
        print!("\nContinue? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("❌ Aborted");
            return Ok(());
        }
    }

    languages.languages.remove(index);
    save_languages_config(&config_path, &languages)?;

    println!("✅ Language '{}' removed successfully!", name);
    println!("\n📋 Next steps:");
    println!("  1. Restart the worker; queued jobs in this language will fail as unknown");

    Ok(())
}

/// List all configured languages
pub fn list_languages() -> Result<()> {
    let config_path = Config::from_env().languages_config;
    let languages = load_languages_config(&config_path)?;

    if languages.languages.is_empty() {
        println!("No languages configured in {}.", config_path.display());
        println!("\n💡 The worker falls back to its built-in py and js runtimes");
        return Ok(());
    }

    println!("📋 Configured Languages:\n");
    println!("{:<8} {:<30} {:<18} {:<12} {:<10}",
             "Name", "Image", "Container", "Command", "CPU/Mem");
    println!("{}", "─".repeat(90));

    for lang in &languages.languages {
        println!("{:<8} {:<30} {:<18} {:<12} {:.1}/{} MB",
                 lang.name,
                 lang.image_ref(),
                 lang.container_name,
                 lang.command,
                 lang.cpu_limit,
                 lang.memory_limit_mb);
    }

    println!("\n✅ Total: {} language(s)", languages.languages.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_official_submission_has_no_session() {
        let job = build_job(7, "py", "print(1)".into(), Some(42), Some("ignored".into()));
        assert_eq!(job.submitted_id, Some(42));
        assert!(job.session_token.is_none());
        assert!(job.enqueued_at.is_some());
        assert_eq!(Queue::for_job(&job), Queue::Problem);
    }

    #[test]
    fn test_test_run_gets_a_session() {
        let job = build_job(7, "mysql", "SELECT 1".into(), None, None);
        let token = job.session_token.clone().unwrap();
        assert!(Uuid::parse_str(&token).is_ok());
        assert_eq!(Queue::for_job(&job), Queue::TestMysql);

        let named = build_job(7, "js", "x".into(), None, Some("sock-9".into()));
        assert_eq!(named.session_token.as_deref(), Some("sock-9"));
    }

    #[test]
    fn test_new_runtime_defaults() {
        let rt = new_runtime("rb", "online_ruby", None, None, 128, 0.5).unwrap();
        assert_eq!(rt.container_name, "rb_oj");
        assert_eq!(rt.command, "rb");
        assert_eq!(rt.memory_limit_mb, 128);

        assert!(new_runtime("r/b", "img", None, None, 128, 0.5).is_err());
        assert!(new_runtime("rb", "img", None, None, 0, 0.5).is_err());
    }

    #[test]
    fn test_duplicate_runtime_rejected() {
        let mut file = LanguagesFile::default();
        let rt = new_runtime("py", "online_python", Some("python_oj"), Some("python3"), 256, 1.0).unwrap();
        insert_runtime(&mut file, rt.clone()).unwrap();
        assert!(insert_runtime(&mut file, rt).is_err());
        assert_eq!(file.languages.len(), 1);
    }

    #[test]
    fn test_languages_file_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("languages.json");

        assert!(load_languages_config(&path).unwrap().languages.is_empty());

        let mut file = LanguagesFile::default();
        insert_runtime(&mut file, new_runtime("js", "online_javascript", Some("javascript_oj"), Some("node"), 256, 1.0).unwrap()).unwrap();
        save_languages_config(&path, &file).unwrap();

        let loaded = load_languages_config(&path).unwrap();
        assert_eq!(loaded.languages[0].command, "node");
    }
}
