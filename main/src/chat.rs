use std::collections::VecDeque;
use std::io::{BufRead, Write};

use clap::Parser;
use common::utils::config::AppConfig;
use futures::StreamExt;
use query_engine::{ChatMessage, ChatOptions, ChatOutput, GraphRagClient};

/// How many turns the terminal session keeps for follow-up questions.
const HISTORY_LIMIT: usize = 10;

/// One-shot chat loop over the graph query engine.
#[derive(Debug, Parser)]
#[command(name = "chat", version, about = "Query a knowledge graph from the terminal")]
struct Args {
    /// Search engine to use: local or global
    #[arg(long, default_value = "local")]
    engine: String,

    /// Stream the answer as it is generated
    #[arg(long)]
    stream: bool,

    /// Directory holding the graph parquet tables
    #[arg(long, default_value = "./context", env = "GRAPH_RAG_OPENAI__CONTEXT_DIR")]
    context_dir: String,

    #[arg(long, env = "GRAPH_RAG_OPENAI__CHAT_MODEL")]
    chat_model: String,

    #[arg(long, env = "GRAPH_RAG_OPENAI__CHAT_API_KEY")]
    chat_api_key: String,

    #[arg(
        long,
        default_value = "https://api.openai.com/v1",
        env = "GRAPH_RAG_OPENAI__CHAT_BASE_URL"
    )]
    chat_base_url: String,

    #[arg(long, env = "GRAPH_RAG_OPENAI__EMBEDDING_MODEL")]
    embedding_model: String,

    #[arg(long, env = "GRAPH_RAG_OPENAI__EMBEDDING_API_KEY")]
    embedding_api_key: Option<String>,

    #[arg(
        long,
        default_value = "https://api.openai.com/v1",
        env = "GRAPH_RAG_OPENAI__EMBEDDING_BASE_URL"
    )]
    embedding_base_url: String,

    /// Print context statistics after each answer
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn to_config(&self) -> Result<AppConfig, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "chat_model": self.chat_model,
            "chat_api_key": self.chat_api_key,
            "chat_base_url": self.chat_base_url,
            "embedding_model": self.embedding_model,
            "embedding_api_key": self.embedding_api_key,
            "embedding_base_url": self.embedding_base_url,
            "context_dir": self.context_dir,
        }))
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            std::process::exit(1);
        }
        // --help and --version land here
        Err(err) => {
            let _ = err.print();
            return Ok(());
        }
    };
    if args.engine != "local" && args.engine != "global" {
        return Err(format!("invalid engine '{}', must be 'local' or 'global'", args.engine).into());
    }

    let client = GraphRagClient::from_config(&args.to_config()?).await?;
    let mut history: VecDeque<ChatMessage> = VecDeque::new();
    let stdin = std::io::stdin();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = stdin.lock().lines().next() else {
            break;
        };
        let line = line?;
        let question = line.trim();
        if question.is_empty() || question == "exit" || question == "quit" {
            break;
        }

        history.push_back(ChatMessage::user(question));
        // drop whole QA pairs so the window still starts with a user turn
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
            history.pop_front();
        }

        let messages: Vec<ChatMessage> = history.iter().cloned().collect();
        let output = client
            .chat(
                &args.engine,
                messages,
                args.stream,
                args.verbose,
                &ChatOptions::default(),
            )
            .await?;

        let answer = match output {
            ChatOutput::Complete(result) => {
                let content = result.choice.message.content.clone().unwrap_or_default();
                println!("{content}");
                if args.verbose {
                    if let Some(verbose) = &result.verbose {
                        eprintln!(
                            "[{} llm calls, {:.2}s]",
                            verbose.llm_calls, verbose.completion_time
                        );
                    }
                }
                content
            }
            ChatOutput::Stream(mut chunks) => {
                let mut content = String::new();
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk?;
                    if let Some(delta) = &chunk.choice.delta.content {
                        print!("{delta}");
                        std::io::stdout().flush()?;
                        content.push_str(delta);
                    }
                }
                println!();
                content
            }
        };
        history.push_back(ChatMessage::assistant(answer));
    }

    Ok(())
}
