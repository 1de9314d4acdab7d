use std::{
    collections::BTreeSet,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use orgtree::attributes;
use orgtree::clock::{clock_duration, clock_duration_within};
use orgtree::core::{ElementId, ElementKind, OrgTree, Tag};
use orgtree::interval::{IntervalDuration, TimeInterval};
use orgtree::parser::NomOrgParser;
use orgtree::storage::OrgParser;
use regex::Regex;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "orgtree",
    about = "Inspect and rewrite Org outlines built on the orgtree crate",
    version
)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides this).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Org files and print their element tree.
    Parse(ParseArgs),

    /// Re-emit Org files from their parsed tree.
    Format(FormatArgs),

    /// Report clocked time per headline.
    Clock(ClockArgs),

    /// Resolve an inherited property for matching headlines.
    Property(PropertyArgs),

    /// Print the effective tags of matching headlines.
    Tags(TagsArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of the indented tree dump.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Org files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct ClockArgs {
    /// Org files or directories to report on.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Inclusive start date (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct PropertyArgs {
    /// Org files or directories to search.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Regular expression matched against headline captions.
    #[arg(long)]
    headline: String,
    /// Property key to resolve.
    #[arg(long)]
    key: String,
}

#[derive(Debug, Args)]
struct TagsArgs {
    /// Org files or directories to search.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Regular expression matched against headline captions.
    #[arg(long)]
    headline: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Format(args) => handle_format(args),
        Commands::Clock(args) => handle_clock(args),
        Commands::Property(args) => handle_property(args),
        Commands::Tags(args) => handle_tags(args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "orgtree=debug" } else { "orgtree=warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Expand inputs and parse every file found.
fn load_trees(inputs: &[PathBuf]) -> Result<Vec<(PathBuf, OrgTree)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }
    let parser = NomOrgParser;
    let mut parsed = Vec::with_capacity(expanded.len());
    for path in expanded {
        let tree = parser
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        parsed.push((path, tree));
    }
    Ok(parsed)
}

fn print_sections(parsed: &[(PathBuf, OrgTree)], render: impl Fn(&OrgTree) -> Result<String>) -> Result<()> {
    for (idx, (path, tree)) in parsed.iter().enumerate() {
        if parsed.len() > 1 {
            if idx > 0 {
                println!();
            }
            println!("== {} ==", path.display());
        }
        print!("{}", render(tree)?);
    }
    Ok(())
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let parsed = load_trees(&inputs)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            tree: &'a OrgTree,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, tree)| JsonOutput {
                path: path.display().to_string(),
                tree,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    print_sections(&parsed, |tree| Ok(tree.describe(tree.root())))
}

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let parsed = load_trees(&inputs)?;

    for (path, tree) in &parsed {
        verify_round_trip(path, &orgtree::write_string(tree))?;
    }
    if in_place {
        for (path, tree) in &parsed {
            let file = fs::File::create(path).with_context(|| format!("writing {:?}", path))?;
            orgtree::write(file, tree).with_context(|| format!("writing {:?}", path))?;
            info!(path = ?path, "formatted");
        }
        return Ok(());
    }
    print!("{}", format_listing(&parsed));
    Ok(())
}

/// A single file is emitted unchanged. Several files get `== path ==` headers,
/// with a line break added only where a file lacks a final newline.
fn format_listing(parsed: &[(PathBuf, OrgTree)]) -> String {
    if let [(_, tree)] = parsed {
        return orgtree::write_string(tree);
    }
    let mut out = String::new();
    for (idx, (path, tree)) in parsed.iter().enumerate() {
        if idx > 0 {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }
        let _ = writeln!(out, "== {} ==", path.display());
        out.push_str(&orgtree::write_string(tree));
    }
    out
}

/// The writer must reproduce the file exactly; compare sizes before content.
fn verify_round_trip(path: &Path, written: &str) -> Result<()> {
    let original = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    if original.len() != written.len() {
        anyhow::bail!(
            "{:?}: round trip changed size from {} to {} bytes",
            path,
            original.len(),
            written.len()
        );
    }
    if original != written {
        anyhow::bail!("{:?}: round trip changed content", path);
    }
    debug!(path = ?path, bytes = written.len(), "round trip verified");
    Ok(())
}

fn handle_clock(args: ClockArgs) -> Result<()> {
    let ClockArgs { inputs, from, to } = args;
    let window = clock_window(from, to)?;
    let parsed = load_trees(&inputs)?;
    print_sections(&parsed, |tree| Ok(render_clock_report(tree, window.as_ref())))
}

fn handle_property(args: PropertyArgs) -> Result<()> {
    let PropertyArgs {
        inputs,
        headline,
        key,
    } = args;
    let pattern = Regex::new(&headline).with_context(|| format!("invalid pattern {headline:?}"))?;
    let parsed = load_trees(&inputs)?;
    print_sections(&parsed, |tree| Ok(render_property(tree, &pattern, &key)))
}

fn handle_tags(args: TagsArgs) -> Result<()> {
    let TagsArgs { inputs, headline } = args;
    let pattern = Regex::new(&headline).with_context(|| format!("invalid pattern {headline:?}"))?;
    let parsed = load_trees(&inputs)?;
    print_sections(&parsed, |tree| Ok(render_tags(tree, &pattern)))
}

/// `--from`/`--to` as a half-open window; the end date is included.
/// `None` when neither bound is given.
fn clock_window(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<Option<TimeInterval>> {
    if from.is_none() && to.is_none() {
        return Ok(None);
    }
    if let (Some(first), Some(last)) = (from, to) {
        if first > last {
            anyhow::bail!("--from {first} is after --to {last}");
        }
    }
    let start = from.map(|d| d.and_time(NaiveTime::MIN));
    let end = match to {
        Some(d) => {
            let next = d
                .succ_opt()
                .with_context(|| format!("--to {d} is out of range"))?;
            Some(next.and_time(NaiveTime::MIN))
        }
        None => None,
    };
    Ok(Some(TimeInterval::new(start, end)))
}

fn render_clock_report(tree: &OrgTree, window: Option<&TimeInterval>) -> String {
    let total = |id: ElementId| match window {
        Some(w) => clock_duration_within(tree, id, w),
        None => clock_duration(tree, id),
    };
    let mut out = String::new();
    for id in tree.find_all(tree.root(), ElementKind::Headline, None, |_| true) {
        let duration = total(id);
        if duration == IntervalDuration::ZERO {
            continue;
        }
        if let Some(h) = tree.get(id).as_headline() {
            let indent = "  ".repeat(h.level.saturating_sub(1));
            let _ = writeln!(out, "{:>6}  {indent}{}", duration.to_string(), h.caption);
        }
    }
    let _ = writeln!(out, "{:>6}  total", total(tree.root()).to_string());
    out
}

fn render_property(tree: &OrgTree, pattern: &Regex, key: &str) -> String {
    let mut out = String::new();
    for id in tree.find_all(tree.root(), ElementKind::Headline, None, |e| e.is_match(pattern)) {
        let caption = tree.get(id).as_headline().map(|h| h.caption.as_str()).unwrap_or_default();
        match attributes::property(tree, id, key) {
            Ok(value) => {
                let _ = writeln!(out, "{caption}: {value}");
            }
            Err(err) => debug!(caption, %err, "property not resolved"),
        }
    }
    out
}

fn render_tags(tree: &OrgTree, pattern: &Regex) -> String {
    let mut out = String::new();
    for id in tree.find_all(tree.root(), ElementKind::Headline, None, |e| e.is_match(pattern)) {
        let caption = tree.get(id).as_headline().map(|h| h.caption.as_str()).unwrap_or_default();
        let effective = attributes::tags(tree, id);
        let tags: Vec<&str> = effective.iter().map(Tag::as_str).collect();
        let _ = writeln!(out, "{caption}: :{}:", tags.join(":"));
    }
    out
}

fn collect_org_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn is_org_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "org")
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = ?canonical, "scanning directory");
            for file in collect_org_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_org_file(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            debug!(file = ?canonical, "adding file");
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut BTreeSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_org_file(&canonical) {
        debug!(file = ?canonical, "found org file");
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgtree::parse_str;

    #[test]
    fn expand_inputs_scans_directories_and_skips_other_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let nested = root.join("notes/archive");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(root.join("b.org"), "* B\n").expect("write b");
        fs::write(nested.join("a.org"), "* A\n").expect("write a");
        fs::write(root.join("readme.txt"), "not org").expect("write txt");

        let found = expand_inputs(&[root.to_path_buf(), root.join("b.org")]).expect("expand");
        let names: Vec<String> = found
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a.org".to_string()));
        assert!(names.contains(&"b.org".to_string()));
    }

    #[test]
    fn expand_inputs_rejects_non_org_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let txt = tmp.path().join("notes.txt");
        fs::write(&txt, "plain").expect("write txt");
        assert!(expand_inputs(&[txt]).is_err());
    }

    #[test]
    fn round_trip_check_compares_with_the_file_on_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("notes.org");
        let text = "#+TITLE: Notes\r\n* Heading :x:\r\nbody";
        fs::write(&path, text).expect("write notes");
        let tree = NomOrgParser.parse_file(&path).expect("parse");
        verify_round_trip(&path, &orgtree::write_string(&tree)).expect("identical");
        assert!(verify_round_trip(&path, "* Heading\n").is_err());
    }

    #[test]
    fn format_listing_keeps_a_single_file_byte_identical() {
        let text = "* Heading\nno final newline";
        let single = vec![(PathBuf::from("one.org"), parse_str(text, "one.org"))];
        assert_eq!(format_listing(&single), text);

        let both = vec![
            (PathBuf::from("one.org"), parse_str(text, "one.org")),
            (PathBuf::from("two.org"), parse_str("* Two\n", "two.org")),
        ];
        assert_eq!(
            format_listing(&both),
            "== one.org ==\n* Heading\nno final newline\n\n== two.org ==\n* Two\n"
        );
    }

    #[test]
    fn clock_window_includes_the_end_date() {
        let from = NaiveDate::from_ymd_opt(2015, 3, 26);
        let to = NaiveDate::from_ymd_opt(2015, 3, 27);
        let window = clock_window(from, to).expect("window").expect("bounded");
        assert_eq!(window.duration(), IntervalDuration::Seconds(2 * 24 * 3600));
        assert!(clock_window(None, None).expect("no window").is_none());
        assert!(clock_window(to, from).is_err());
        assert!(clock_window(from, from).expect("one day").is_some());
        assert!(clock_window(None, to).expect("open start").is_some());
    }

    #[test]
    fn clock_report_lists_clocked_headlines() {
        let tree = parse_str(
            r#"* Project
** Design
CLOCK: [2015-03-26 Thu 10:00]--[2015-03-26 Thu 11:30] =>  1:30
** Idle
* Other
CLOCK: [2015-03-27 Fri 09:00]--[2015-03-27 Fri 09:15] =>  0:15
"#,
            "report.org",
        );
        let report = render_clock_report(&tree, None);
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(
            lines,
            vec![
                "  1:30  Project",
                "  1:30    Design",
                "  0:15  Other",
                "  1:45  total"
            ]
        );

        let day = TimeInterval::day(NaiveDate::from_ymd_opt(2015, 3, 27).expect("date"));
        let report = render_clock_report(&tree, Some(&day));
        assert_eq!(report.lines().collect::<Vec<_>>(), vec!["  0:15  Other", "  0:15  total"]);
    }

    #[test]
    fn property_and_tag_rendering() {
        let tree = parse_str(
            "#+FILETAGS: :home:\n* Parent :p:\n:PROPERTIES:\n:OWNER: alice\n:END:\n** Child\n",
            "render.org",
        );
        let all = Regex::new(".").expect("regex");
        assert_eq!(render_property(&tree, &all, "OWNER"), "Parent: alice\nChild: alice\n");
        assert_eq!(render_property(&tree, &all, "MISSING"), "");
        let child = Regex::new("^Child$").expect("regex");
        assert_eq!(render_tags(&tree, &child), "Child: :home:p:\n");
    }
}
