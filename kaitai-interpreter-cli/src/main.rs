use anyhow::{anyhow, Context as _};
use argh::FromArgs;
use kaitai_interpreter::{compile_schema, parse_with_schema, CompileOptions, ImportResolver};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(FromArgs, Debug)]
/// Parse a binary file against a Kaitai Struct schema and print the
/// resulting object tree.
struct Cli {
    /// path to the .ksy schema file
    #[argh(positional)]
    schema: PathBuf,

    /// path to the binary file to parse
    #[argh(positional)]
    binary: Option<PathBuf>,

    /// write output to a file instead of standard out
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,

    /// force pretty-printed output
    #[argh(switch, short = 'p')]
    pretty: bool,

    /// force compact output
    #[argh(switch)]
    no_pretty: bool,

    /// output format: json or yaml (default json)
    #[argh(option, short = 'f', default = "String::from(\"json\")")]
    format: String,

    /// extract a sub-value by dotted path, e.g. items[1].value
    #[argh(option)]
    field: Option<String>,

    /// skip schema validation warnings
    #[argh(switch)]
    no_validate: bool,

    /// promote validator warnings to errors
    #[argh(switch)]
    strict: bool,

    /// suppress progress messages on standard error
    #[argh(switch, short = 'q')]
    quiet: bool,

    /// print version and exit
    #[argh(switch, short = 'v')]
    version: bool,
}

const EXIT_GENERAL: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_SCHEMA: i32 = 3;

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let args: Vec<String> = std::env::args().collect();
    let arg_refs: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();
    let cli = match Cli::from_args(&["kaitai"], &arg_refs) {
        Ok(cli) => cli,
        Err(early) => {
            return if early.status.is_ok() {
                println!("{}", early.output);
                0
            } else {
                eprintln!("{}", early.output);
                EXIT_USAGE
            };
        }
    };

    if cli.version {
        println!("kaitai {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    let schema = cli.schema.clone();
    let Some(binary) = cli.binary.clone() else {
        eprintln!("usage: kaitai <schema-file> <binary-file> [flags]");
        return EXIT_USAGE;
    };

    match run(&cli, &schema, &binary) {
        Ok(()) => 0,
        Err(e) => match e.downcast_ref::<kaitai_interpreter::Error>() {
            Some(err) => {
                eprintln!("kaitai: {}: {err}", err.kind().as_str());
                if err.kind() == kaitai_interpreter::ErrorKind::Validation {
                    EXIT_SCHEMA
                } else {
                    EXIT_GENERAL
                }
            }
            None => {
                eprintln!("kaitai: {e:#}");
                EXIT_GENERAL
            }
        },
    }
}

/// Resolves `meta.imports` entries against the schema's directory and its
/// parent, appending `.ksy` when the entry does not carry it.
struct FileResolver {
    schema_dir: PathBuf,
}

impl ImportResolver for FileResolver {
    fn resolve(&self, path: &str) -> Option<String> {
        let file = if path.ends_with(".ksy") {
            path.to_string()
        } else {
            format!("{path}.ksy")
        };
        let candidates = [
            self.schema_dir.join(&file),
            self.schema_dir.join("..").join(&file),
        ];
        candidates
            .iter()
            .find_map(|c| std::fs::read_to_string(c).ok())
    }
}

fn run(cli: &Cli, schema_path: &Path, binary_path: &Path) -> anyhow::Result<()> {
    let schema_text = std::fs::read_to_string(schema_path)
        .with_context(|| format!("cannot read schema {}", schema_path.display()))?;
    let data = std::fs::read(binary_path)
        .with_context(|| format!("cannot read input {}", binary_path.display()))?;

    let resolver = FileResolver {
        schema_dir: schema_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let options = CompileOptions {
        strict: cli.strict,
        validate: !cli.no_validate,
        resolver: Some(&resolver),
    };

    if !cli.quiet {
        eprintln!(
            "parsing {} ({} bytes) with schema {}",
            binary_path.display(),
            data.len(),
            schema_path.display()
        );
    }

    let compiled = Rc::new(compile_schema(&schema_text, &options)?);
    if !cli.quiet {
        for warning in &compiled.warnings {
            eprintln!("kaitai: {warning}");
        }
    }

    let document = parse_with_schema(compiled, &data)?;
    let mut rendered = document.to_json();
    if let Some(path) = &cli.field {
        rendered = extract_field(&rendered, path)
            .ok_or_else(|| anyhow!("no value at field path {path:?}"))?
            .clone();
    }

    let pretty = if cli.no_pretty {
        false
    } else {
        cli.pretty || (cli.output.is_none() && std::io::stdout().is_terminal())
    };

    let text = match cli.format.as_str() {
        "json" => {
            if pretty {
                serde_json::to_string_pretty(&rendered)?
            } else {
                serde_json::to_string(&rendered)?
            }
        }
        "yaml" => serde_yaml::to_string(&rendered)?,
        other => {
            return Err(anyhow!(
                "unknown output format {other:?} (expected json or yaml)"
            ))
        }
    };

    match &cli.output {
        Some(path) => {
            let mut file = std::fs::File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            writeln!(file, "{text}")?;
        }
        None => println!("{text}"),
    }

    if !cli.quiet {
        eprintln!("done");
    }
    Ok(())
}

/// Dotted path with bracket indexing over the rendered JSON tree.
fn extract_field<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for segment in path.split('.') {
        let (name, indices) = split_segment(segment)?;
        if !name.is_empty() {
            current = current.get(name)?;
        }
        for idx in indices {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

fn split_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let (name, mut rest) = segment.split_at(open);
    let mut indices = Vec::new();
    while !rest.is_empty() {
        let (inner, tail) = rest.strip_prefix('[')?.split_once(']')?;
        indices.push(inner.parse().ok()?);
        rest = tail;
    }
    Some((name, indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_extraction_paths() {
        let tree = json!({
            "items": [
                {"value": [10, 20]},
                {"value": [30]}
            ],
            "count": 2
        });
        assert_eq!(extract_field(&tree, "count"), Some(&json!(2)));
        assert_eq!(extract_field(&tree, "items[1].value[0]"), Some(&json!(30)));
        assert_eq!(extract_field(&tree, "items[9]"), None);
        assert_eq!(extract_field(&tree, "missing"), None);
    }

    #[test]
    fn segment_splitting() {
        assert_eq!(split_segment("name"), Some(("name", vec![])));
        assert_eq!(split_segment("a[0][2]"), Some(("a", vec![0, 2])));
        assert_eq!(split_segment("a[x]"), None);
    }
}
