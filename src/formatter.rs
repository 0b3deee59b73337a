//! Output rendering. Stdout carries exactly one payload in the selected
//! format; human text goes to stdout too, but diagnostics always stay on
//! stderr (machine formats set the log filter accordingly).

use crate::get::{LsEntry, LsOutput, ResolvedFile, ResolvedFileStub};
use crate::search::SearchResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
    Md,
    Xml,
    Files,
}

impl OutputFormat {
    /// Machine formats redirect all diagnostics to stderr.
    pub fn is_machine(self) -> bool {
        self != OutputFormat::Text
    }

    /// Pick the format from the CLI flags; the first set flag wins.
    pub fn from_flags(json: bool, csv: bool, md: bool, xml: bool, files: bool) -> Self {
        if json {
            OutputFormat::Json
        } else if csv {
            OutputFormat::Csv
        } else if md {
            OutputFormat::Md
        } else if xml {
            OutputFormat::Xml
        } else if files {
            OutputFormat::Files
        } else {
            OutputFormat::Text
        }
    }
}

pub fn format_results(results: &[SearchResult], format: OutputFormat, full: bool) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(results).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Files => {
            let mut out = String::new();
            for r in results {
                out.push_str(&r.file);
                out.push('\n');
            }
            out
        }
        OutputFormat::Csv => {
            let mut out =
                String::from("docid,score,file,title,context,alsoIn,snippet\n");
            for r in results {
                out.push_str(&format!(
                    "{},{:.4},{},{},{},{},{}\n",
                    csv_escape(r.docid.as_deref().unwrap_or("")),
                    r.score,
                    csv_escape(&r.file),
                    csv_escape(&r.title),
                    csv_escape(r.context.as_deref().unwrap_or("")),
                    csv_escape(&r.also_in.join(";")),
                    csv_escape(&r.snippet),
                ));
            }
            out
        }
        OutputFormat::Md => {
            let mut out = String::new();
            for (i, r) in results.iter().enumerate() {
                out.push_str(&format!(
                    "## {}. {} ({:.2})\n\n`{}`",
                    i + 1,
                    r.title,
                    r.score,
                    r.file
                ));
                if let Some(docid) = &r.docid {
                    out.push_str(&format!(" `#{docid}`"));
                }
                out.push_str("\n\n");
                if let Some(ctx) = &r.context {
                    out.push_str(&format!("> {ctx}\n\n"));
                }
                let body = if full { &r.body } else { &r.snippet };
                if !body.is_empty() {
                    out.push_str(body);
                    out.push_str("\n\n");
                }
            }
            out
        }
        OutputFormat::Xml => {
            let mut out = String::from("<results>\n");
            for r in results {
                out.push_str("  <result>\n");
                if let Some(docid) = &r.docid {
                    out.push_str(&format!("    <docid>{}</docid>\n", xml_escape(docid)));
                }
                out.push_str(&format!("    <score>{:.4}</score>\n", r.score));
                out.push_str(&format!("    <file>{}</file>\n", xml_escape(&r.file)));
                out.push_str(&format!("    <title>{}</title>\n", xml_escape(&r.title)));
                if let Some(ctx) = &r.context {
                    out.push_str(&format!("    <context>{}</context>\n", xml_escape(ctx)));
                }
                for also in &r.also_in {
                    out.push_str(&format!("    <alsoIn>{}</alsoIn>\n", xml_escape(also)));
                }
                let body = if full { &r.body } else { &r.snippet };
                out.push_str(&format!("    <body>{}</body>\n", xml_escape(body)));
                out.push_str("  </result>\n");
            }
            out.push_str("</results>\n");
            out
        }
        OutputFormat::Text => {
            if results.is_empty() {
                return "No results.\n".to_string();
            }
            let mut out = String::new();
            for (i, r) in results.iter().enumerate() {
                out.push_str(&format!(
                    "{}. [{:.2}] {} — {}",
                    i + 1,
                    r.score,
                    r.file,
                    r.title
                ));
                if let Some(docid) = &r.docid {
                    out.push_str(&format!("  #{docid}"));
                }
                out.push('\n');
                if let Some(ctx) = &r.context {
                    out.push_str(&format!("   context: {ctx}\n"));
                }
                if !r.also_in.is_empty() {
                    out.push_str(&format!("   also in: {}\n", r.also_in.join(", ")));
                }
                let body = if full { &r.body } else { &r.snippet };
                for line in body.lines().take(if full { usize::MAX } else { 3 }) {
                    out.push_str(&format!("   {line}\n"));
                }
                out.push('\n');
            }
            out
        }
    }
}

pub fn format_documents(files: &[ResolvedFile], format: OutputFormat, full: bool) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(files).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Files => {
            let mut out = String::new();
            for f in files {
                out.push_str(&format!("qmd://{}/{}\n", f.collection, f.path));
            }
            out
        }
        OutputFormat::Csv => {
            let mut out = String::from("docid,file,title,bytes\n");
            for f in files {
                out.push_str(&format!(
                    "{},{},{},{}\n",
                    csv_escape(&f.docid),
                    csv_escape(&format!("qmd://{}/{}", f.collection, f.path)),
                    csv_escape(&f.title),
                    f.body.len()
                ));
            }
            out
        }
        OutputFormat::Md => {
            let mut out = String::new();
            for f in files {
                out.push_str(&format!("## qmd://{}/{}\n\n", f.collection, f.path));
                if full || !f.body.is_empty() {
                    out.push_str(&f.body);
                    if !f.body.ends_with('\n') {
                        out.push('\n');
                    }
                    out.push('\n');
                }
            }
            out
        }
        OutputFormat::Xml => {
            let mut out = String::from("<documents>\n");
            for f in files {
                out.push_str("  <document>\n");
                out.push_str(&format!(
                    "    <file>qmd://{}/{}</file>\n",
                    xml_escape(&f.collection),
                    xml_escape(&f.path)
                ));
                out.push_str(&format!("    <title>{}</title>\n", xml_escape(&f.title)));
                out.push_str(&format!("    <body>{}</body>\n", xml_escape(&f.body)));
                out.push_str("  </document>\n");
            }
            out.push_str("</documents>\n");
            out
        }
        OutputFormat::Text => {
            let mut out = String::new();
            for f in files {
                out.push_str(&format!("--- qmd://{}/{} ---\n", f.collection, f.path));
                out.push_str(&f.body);
                if !f.body.ends_with('\n') {
                    out.push('\n');
                }
            }
            out
        }
    }
}

pub fn format_ls(output: &LsOutput, format: OutputFormat) -> String {
    match output {
        LsOutput::Collections(entries) => format_ls_collections(entries, format),
        LsOutput::Files(stubs) => format_ls_files(stubs, format),
    }
}

fn format_ls_collections(entries: &[LsEntry], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(entries).unwrap_or_else(|_| "[]".to_string())
        }
        _ => {
            if entries.is_empty() {
                return "No collections registered.\n".to_string();
            }
            let mut out = String::new();
            for e in entries {
                out.push_str(&format!("{}\t{} documents\n", e.name, e.documents));
            }
            out
        }
    }
}

fn format_ls_files(stubs: &[ResolvedFileStub], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(stubs).unwrap_or_else(|_| "[]".to_string())
        }
        _ => {
            let mut out = String::new();
            for s in stubs {
                out.push_str(&format!("{}\t{}\t#{}\n", s.file, s.title, s.docid));
            }
            out
        }
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
