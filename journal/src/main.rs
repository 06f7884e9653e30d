use std::{
    env, fs,
    io::{IsTerminal, Write},
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use journal::format::{format_count_table, format_entries};
use journal::lint::LintError;
use journal::projectors::count_projector;
use journal::projectors::graph_projector::{GraphOptions, NodeSize, ReferenceGraph, render_dot};
use journal::storage::{self, EntryStore, LoadOptions};
use journal::{DateSpec, Entry, Query, QueryOptions, Selection, TimeUnit};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "journal",
    about = "Query, summarize and check a plain-text journal",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(flatten)]
    store: StoreArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Snapshot the journal directory into a bzip2 tarball.
    Archive(ArchiveArgs),

    /// Print post and word statistics per period.
    Count(CountArgs),

    /// Print the back-reference graph in Graphviz DOT.
    Graph(GraphArgs),

    /// Print matching titles, one per line.
    List(FilterArgs),

    /// Print matching entries, or open them in an editor on a terminal.
    Show(FilterArgs),

    /// Lint the journal and, when clean, rewrite the cache and tag index.
    Update,

    /// Lint the journal and report every violation.
    Verify,
}

#[derive(Debug, Args)]
struct StoreArgs {
    /// Journal directory.
    #[arg(
        long,
        global = true,
        env = "JOURNAL_DIRECTORY",
        default_value = "."
    )]
    directory: PathBuf,
    /// Journal file to leave out; may be repeated.
    #[arg(long = "ignore", value_name = "PATH", global = true)]
    ignores: Vec<PathBuf>,
    /// Read the journal files even when the cache is fresh.
    #[arg(long, global = true)]
    no_cache: bool,
}

impl StoreArgs {
    fn load(&self, use_cache: bool) -> Result<EntryStore> {
        let options = LoadOptions {
            use_cache: use_cache && !self.no_cache,
            ignores: self.ignores.clone(),
        };
        EntryStore::load(&self.directory, &options)
            .with_context(|| format!("loading journal from {:?}", self.directory))
    }
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// Regular expressions every entry must match.
    terms: Vec<String>,
    /// Date ranges such as 2020, 2020-01:2020-03, 2021-05: or :2019,2022.
    #[arg(short = 'd', long = "dates", value_name = "SPEC")]
    dates: Option<DateSpec>,
    /// Match terms case-sensitively.
    #[arg(short = 'i', long)]
    case_sensitive: bool,
    /// Only match terms on word boundaries.
    #[arg(short = 'w', long)]
    whole_words: bool,
    /// Leave out entries without a date title.
    #[arg(long)]
    dates_only: bool,
    /// Keep at most N entries after ordering.
    #[arg(short = 'n', long, value_name = "N")]
    limit: Option<usize>,
    /// Newest first.
    #[arg(short, long, conflicts_with = "chronological")]
    reverse: bool,
    /// Oldest first (the default).
    #[arg(short, long)]
    chronological: bool,
}

impl FilterArgs {
    fn query(&self) -> Result<Query> {
        let ranges = self
            .dates
            .as_ref()
            .map(|spec| spec.ranges().to_vec())
            .unwrap_or_default();
        let options = QueryOptions {
            ignore_case: !self.case_sensitive,
            whole_words: self.whole_words,
            dates_only: self.dates_only,
        };
        Ok(Query::new(self.terms.as_slice(), ranges, options)?)
    }

    /// Ordered, limited selection; an empty result is an error.
    fn select<'a>(&self, store: &'a EntryStore) -> Result<Vec<&'a Entry>> {
        let query = self.query()?;
        let mut entries: Vec<&Entry> = store.filter(&query).into_values().collect();
        if self.reverse {
            entries.reverse();
        }
        if let Some(limit) = self.limit {
            entries.truncate(limit);
        }
        if entries.is_empty() {
            anyhow::bail!("no entries match the given filters");
        }
        debug!(selected = entries.len(), "filtered entries");
        Ok(entries)
    }

    fn log_search(&self, root: &Path, operation: &str) {
        let spec = self.dates.as_ref().map(DateSpec::as_str);
        match storage::append_search_log(root, operation, spec, &self.terms) {
            Ok(true) => debug!(operation, "appended to search log"),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "could not append to search log"),
        }
    }
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    /// Directory to write the tarball into. Defaults to the current directory.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CountArgs {
    #[command(flatten)]
    filter: FilterArgs,
    /// Period to group entries by.
    #[arg(long, value_enum, default_value_t = TimeUnit::Year)]
    unit: TimeUnit,
}

#[derive(Debug, Args)]
struct GraphArgs {
    #[command(flatten)]
    filter: FilterArgs,
    /// Draw every direct reference, including ones implied by a longer path.
    #[arg(long)]
    no_simplify: bool,
    /// How to scale node labels.
    #[arg(long, value_enum, default_value_t = NodeSize::Uniform)]
    node_size: NodeSize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let Cli { store, command, .. } = cli;
    match command {
        Commands::Archive(args) => handle_archive(&store, args),
        Commands::Count(args) => handle_count(&store, args),
        Commands::Graph(args) => handle_graph(&store, args),
        Commands::List(args) => handle_list(&store, args),
        Commands::Show(args) => handle_show(&store, args),
        Commands::Update => handle_update(&store),
        Commands::Verify => handle_verify(&store),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn to_selection<'a>(entries: &[&'a Entry]) -> Selection<'a> {
    entries
        .iter()
        .map(|&entry| (entry.title.key(), entry))
        .collect()
}

fn handle_count(store_args: &StoreArgs, args: CountArgs) -> Result<()> {
    let CountArgs { filter, unit } = args;
    let store = store_args.load(true)?;
    let entries = filter.select(&store)?;
    filter.log_search(store.root(), "count");

    let rows = count_projector::count(&to_selection(&entries), unit, filter.reverse);
    print!("{}", format_count_table(unit, &rows));
    Ok(())
}

fn handle_graph(store_args: &StoreArgs, args: GraphArgs) -> Result<()> {
    let GraphArgs {
        filter,
        no_simplify,
        node_size,
    } = args;
    let store = store_args.load(true)?;
    let entries = filter.select(&store)?;
    filter.log_search(store.root(), "graph");

    let selection = to_selection(&entries);
    let graph = ReferenceGraph::build(
        &selection,
        GraphOptions {
            simplify: !no_simplify,
        },
    );
    info!(
        nodes = graph.nodes().len(),
        edges = graph.edge_count(),
        "built reference graph"
    );
    print!("{}", render_dot(&graph, node_size));
    Ok(())
}

fn handle_list(store_args: &StoreArgs, args: FilterArgs) -> Result<()> {
    let store = store_args.load(true)?;
    let entries = args.select(&store)?;
    args.log_search(store.root(), "list");
    for entry in entries {
        println!("{}", entry.title);
    }
    Ok(())
}

fn handle_show(store_args: &StoreArgs, args: FilterArgs) -> Result<()> {
    let store = store_args.load(true)?;
    let entries = args.select(&store)?;
    args.log_search(store.root(), "show");

    let text = format_entries(entries.iter().copied());
    if std::io::stdout().is_terminal() {
        open_in_editor(&text, &args, store.root())
    } else {
        println!("{text}");
        Ok(())
    }
}

fn handle_update(store_args: &StoreArgs) -> Result<()> {
    let mut store = store_args.load(false)?;
    let errors = store
        .rebuild_metadata()
        .with_context(|| format!("re-indexing {:?}", store_args.directory))?;
    report_violations(&errors)?;
    info!(entries = store.len(), "journal re-indexed");
    Ok(())
}

fn handle_verify(store_args: &StoreArgs) -> Result<()> {
    let mut store = store_args.load(true)?;
    let errors = store.verify()?;
    report_violations(&errors)
}

fn report_violations(errors: &[LintError]) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    for error in errors {
        println!("{error}");
    }
    anyhow::bail!("{} consistency error(s) found", errors.len());
}

/* ---------------------------------- Editor ---------------------------------- */

/// `$VISUAL`, then `$EDITOR`, then vim; split into program and arguments.
fn editor_command() -> Vec<String> {
    ["VISUAL", "EDITOR"]
        .iter()
        .filter_map(|var| env::var(var).ok())
        .map(|value| {
            value
                .split_whitespace()
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .find(|words| !words.is_empty())
        .unwrap_or_else(|| vec!["vim".to_string()])
}

fn is_vim_like(program: &str) -> bool {
    let name = Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program);
    matches!(name, "vi" | "vim" | "nvim" | "gvim" | "mvim")
}

/// Highlight the terms (and any non-ASCII byte) and jump to the top.
fn vim_search_args(terms: &[String], ignore_case: bool) -> Vec<String> {
    let mut args = Vec::new();
    if !terms.is_empty() {
        let case = if ignore_case {
            "set ignorecase nosmartcase"
        } else {
            "set noignorecase"
        };
        let alternatives: Vec<String> = terms.iter().map(|term| format!("({term})")).collect();
        args.extend([
            "-c".to_string(),
            case.to_string(),
            "-c".to_string(),
            format!("/\\v[^\\t -~]|{}", alternatives.join("|")),
        ]);
    }
    for command in [":set nocursorline", ":set nospell", ":0"] {
        args.extend(["-c".to_string(), command.to_string()]);
    }
    args
}

fn open_in_editor(text: &str, filter: &FilterArgs, root: &Path) -> Result<()> {
    let mut file = tempfile::Builder::new()
        .prefix("journal-")
        .suffix(".journal")
        .tempfile()
        .context("creating temporary file")?;
    file.write_all(text.as_bytes())
        .and_then(|_| file.flush())
        .with_context(|| format!("writing {:?}", file.path()))?;
    let mut permissions = fs::metadata(file.path())?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(file.path(), permissions)
        .with_context(|| format!("making {:?} read-only", file.path()))?;

    let editor = editor_command();
    let program = &editor[0];
    let mut command = Command::new(program);
    command.args(&editor[1..]).arg(file.path()).current_dir(root);
    if is_vim_like(program) {
        command.args(vim_search_args(&filter.terms, !filter.case_sensitive));
    }
    debug!(?command, "launching editor");
    let status = command
        .status()
        .with_context(|| format!("launching editor {program}"))?;
    if !status.success() {
        anyhow::bail!("editor {program} exited with {status}");
    }
    Ok(())
}

/* ---------------------------------- Archive --------------------------------- */

fn handle_archive(store_args: &StoreArgs, args: ArchiveArgs) -> Result<()> {
    let root = fs::canonicalize(&store_args.directory)
        .with_context(|| format!("resolving {:?}", store_args.directory))?;
    let output = match args.output {
        Some(dir) => dir,
        None => env::current_dir().context("resolving current directory")?,
    };
    let output =
        fs::canonicalize(&output).with_context(|| format!("resolving {:?}", output))?;

    let name = format!("jrnl{}", Local::now().format("%Y%m%d%H%M%S"));
    let staging = tempfile::tempdir().context("creating staging directory")?;
    let copied = copy_tree(&root, &staging.path().join(&name))?;
    debug!(files = copied, "staged journal directory");

    let archive = output.join(format!("{name}.tbz"));
    let status = Command::new("tar")
        .arg("-jcf")
        .arg(&archive)
        .arg("-C")
        .arg(staging.path())
        .arg(&name)
        .status()
        .context("running tar")?;
    if !status.success() {
        anyhow::bail!("tar exited with {status}");
    }
    println!("{}", archive.display());
    Ok(())
}

/// Copy `src` into `dest`, skipping dotfiles and symlinks. Returns the number of files copied.
fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).with_context(|| format!("creating {:?}", dest))?;
    let mut copied = 0;
    for entry in fs::read_dir(src).with_context(|| format!("reading directory {:?}", src))? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let file_type = entry.file_type()?;
        let target = dest.join(&name);
        if file_type.is_symlink() {
            continue;
        } else if file_type.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {:?}", entry.path()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_skips_dotfiles() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::create_dir_all(src.join(".git")).unwrap();
        fs::write(src.join("2020.journal"), "2020-01-01\n\tx\n").unwrap();
        fs::write(src.join("nested/2021.journal"), "2021-01-01\n\ty\n").unwrap();
        fs::write(src.join(".cache"), "{}").unwrap();
        fs::write(src.join(".git/HEAD"), "ref").unwrap();

        let dest = tmp.path().join("dest");
        assert_eq!(copy_tree(&src, &dest).unwrap(), 2);
        assert!(dest.join("2020.journal").is_file());
        assert!(dest.join("nested/2021.journal").is_file());
        assert!(!dest.join(".cache").exists());
        assert!(!dest.join(".git").exists());
    }

    #[test]
    fn vim_args_search_for_terms() {
        let terms = vec!["movie".to_string(), "cat".to_string()];
        let args = vim_search_args(&terms, true);
        assert_eq!(args[1], "set ignorecase nosmartcase");
        assert_eq!(args[3], "/\\v[^\\t -~]|(movie)|(cat)");
        assert_eq!(args.last().map(String::as_str), Some(":0"));

        let args = vim_search_args(&terms, false);
        assert_eq!(args[1], "set noignorecase");
    }

    #[test]
    fn vim_args_without_terms_only_set_options() {
        assert_eq!(
            vim_search_args(&[], true),
            ["-c", ":set nocursorline", "-c", ":set nospell", "-c", ":0"]
        );
    }

    #[test]
    fn recognizes_vim_like_editors() {
        assert!(is_vim_like("vim"));
        assert!(is_vim_like("/usr/bin/nvim"));
        assert!(!is_vim_like("nano"));
    }

    #[test]
    fn cli_parses_filters() {
        let cli = Cli::try_parse_from([
            "journal", "list", "-d", "2020:2021", "-i", "-n", "3", "-r", "movie",
        ])
        .unwrap();
        let Commands::List(args) = cli.command else {
            panic!("expected list");
        };
        assert_eq!(args.terms, ["movie"]);
        assert_eq!(args.dates.as_ref().map(DateSpec::as_str), Some("2020:2021"));
        assert!(args.case_sensitive && args.reverse);
        assert_eq!(args.limit, Some(3));
    }

    #[test]
    fn cli_rejects_conflicting_order() {
        assert!(Cli::try_parse_from(["journal", "list", "-r", "-c"]).is_err());
    }

    #[test]
    fn cli_rejects_bad_date_specs() {
        assert!(Cli::try_parse_from(["journal", "list", "-d", "2020-13"]).is_err());
    }
}
