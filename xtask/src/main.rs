//! Build automation tasks for docload

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for docload", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<docload_ingest::Cli>();

    let content = format!(
        r#"# docload CLI Reference

Generated from the CLI definitions on {}.

## Quick Start

```bash
# Check a mapping contract
docload-ingest validate-contract --contract contract.json

# Preview the rows one document would produce
docload-ingest transform --contract contract.json --input 1001.xml

# Load a range of staged documents
docload-ingest run --contract contract.json --range-start 1000 --range-end 2000
```

## Environment Variables

- `DATABASE_URL` - Postgres connection string; pool sizing via `DB_MAX_CONNECTIONS` and friends
- `DOCLOAD_CONTRACT` - Default contract path
- `DOCLOAD_WORKERS`, `DOCLOAD_BATCH_SIZE`, `DOCLOAD_QUEUE_CAPACITY` - Run sizing
- `LOG_LEVEL`, `LOG_FORMAT`, `LOG_OUTPUT` - Logging

{}

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());
    Ok(())
}
