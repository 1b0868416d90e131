//! Command-line harness for the stoker runtime.
//!
//! Drives the supervisor, catalog, and completion clients against a
//! local server. Diagnostic output goes to stderr so stdout stays
//! clean for generated text.

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, Write as _};
use std::sync::Arc;
use stoker::{
    ChatEvent, ChatMessage, ChatRequest, CompletionClient, GenerateRequest, ModelCatalog,
    RuntimeConfig, ServerSupervisor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stoker=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        usage();
        std::process::exit(2);
    };

    let config = load_config()?;
    let supervisor = Arc::new(ServerSupervisor::new(config.server.clone()));

    match command {
        "status" => {
            let reachable = supervisor.is_running().await;
            println!("state: {}", supervisor.state());
            println!(
                "server: {}",
                if reachable { "reachable" } else { "unreachable" }
            );
        }
        "start" => {
            supervisor.start().await?;
            println!("server ready at {}", supervisor.config().base_url());
        }
        "stop" => {
            supervisor.stop().await;
            println!("server stopped");
        }
        "kill-orphans" => {
            let killed = supervisor.kill_orphan_processes().await;
            println!("killed {killed} orphan process(es)");
        }
        "version" => {
            let version = supervisor.version().await?;
            println!("{version}");
        }
        "models" => {
            let catalog = ModelCatalog::new(config.catalog.clone(), Arc::clone(&supervisor));
            list_models(&catalog).await?;
        }
        "pull" => {
            let name = required(&args, 1, "model")?;
            let catalog = ModelCatalog::new(config.catalog.clone(), Arc::clone(&supervisor));
            pull(&catalog, name).await?;
        }
        "rm" => {
            let name = required(&args, 1, "model")?;
            let catalog = ModelCatalog::new(config.catalog.clone(), Arc::clone(&supervisor));
            catalog.delete_model(name).await?;
            println!("deleted {name}");
        }
        "run" => {
            let model = required(&args, 1, "model")?.to_string();
            let prompt = args[2..].join(" ");
            if prompt.trim().is_empty() {
                anyhow::bail!("missing <prompt> argument");
            }
            let client = CompletionClient::new(config.chat.clone(), Arc::clone(&supervisor));
            run_generate(&client, model, prompt).await?;
        }
        "chat" => {
            let model = required(&args, 1, "model")?.to_string();
            let client = CompletionClient::new(config.chat.clone(), Arc::clone(&supervisor));
            chat_loop(&client, model).await?;
        }
        _ => {
            eprintln!("unknown command: {command}");
            usage();
            std::process::exit(2);
        }
    }
    Ok(())
}

fn usage() {
    eprintln!(
        "stoker-cli <command>\n\n\
         commands:\n\
         \x20 status                probe the server and report state\n\
         \x20 start                 launch the server and wait until ready\n\
         \x20 stop                  stop the supervised server\n\
         \x20 kill-orphans          force-kill stray server processes\n\
         \x20 version               print the server version\n\
         \x20 models                list installed models\n\
         \x20 pull <model>          download a model with progress\n\
         \x20 rm <model>            delete an installed model\n\
         \x20 run <model> <prompt>  one-shot generation\n\
         \x20 chat <model>          interactive chat"
    );
}

fn required<'a>(args: &'a [String], index: usize, name: &str) -> anyhow::Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing <{name}> argument"))
}

fn load_config() -> anyhow::Result<RuntimeConfig> {
    let path = RuntimeConfig::default_config_path();
    if path.exists() {
        Ok(RuntimeConfig::from_file(&path)?)
    } else {
        Ok(RuntimeConfig::default())
    }
}

async fn list_models(catalog: &ModelCatalog) -> anyhow::Result<()> {
    let models = catalog.list_models().await?;
    if models.is_empty() {
        println!("no models installed");
        return Ok(());
    }
    for model in models {
        let modified = model
            .modified_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:<40} {:>10}  {}",
            model.name,
            human_bytes(model.size),
            modified
        );
    }
    Ok(())
}

async fn pull(catalog: &ModelCatalog, name: &str) -> anyhow::Result<()> {
    let mut stream = catalog.pull_model(name)?;

    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(
        "  {msg} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}",
    ) {
        pb.set_style(style);
    }
    pb.set_message(name.to_owned());

    while let Some(item) = stream.next().await {
        let progress = item?;
        if progress.is_retrying() {
            pb.println(format!(
                "  retrying: {}",
                progress.error.unwrap_or_default()
            ));
            continue;
        }
        if let (Some(total), Some(completed)) = (progress.total, progress.completed) {
            pb.set_length(total);
            pb.set_position(completed);
        }
        pb.set_message(format!("{name}: {}", progress.status));
    }
    pb.finish_with_message(format!("{name} ready"));
    Ok(())
}

async fn run_generate(
    client: &CompletionClient,
    model: String,
    prompt: String,
) -> anyhow::Result<()> {
    let mut stream = client.generate(GenerateRequest::new(model, prompt)).await?;
    while let Some(piece) = stream.next().await {
        print!("{}", piece?);
        std::io::stdout().flush()?;
    }
    println!();
    Ok(())
}

async fn chat_loop(client: &CompletionClient, model: String) -> anyhow::Result<()> {
    eprintln!("chatting with {model} (empty line or ctrl-d to quit)");
    let mut history: Vec<ChatMessage> = Vec::new();
    let stdin = std::io::stdin();

    loop {
        eprint!("> ");
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        history.push(ChatMessage::user(line));
        let request = ChatRequest::new(model.clone(), history.clone());
        let mut stream = client.chat(request).await?;

        let mut reply = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                ChatEvent::Token(token) => {
                    print!("{token}");
                    std::io::stdout().flush()?;
                    reply.push_str(&token);
                }
                ChatEvent::ToolCalls(calls) => {
                    for call in calls {
                        eprintln!("[tool call] {}({})", call.function.name, call.function.arguments);
                    }
                }
            }
        }
        println!();
        history.push(ChatMessage::assistant(reply));
    }
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
