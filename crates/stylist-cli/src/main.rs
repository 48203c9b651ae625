use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use stylist_contracts::advice::AnalysisTask;
use stylist_contracts::chat::{parse_intent, ChatIntent, CHAT_HELP};
use stylist_contracts::config::AppConfig;
use stylist_contracts::events::EventWriter;
use stylist_contracts::products::{AggregatedSuggestions, ProductRecord};
use stylist_engine::{OllamaClient, OutfitReport, QueryAnswer, StylistEngine};

const CARD_NAME_MAX_CHARS: usize = 50;
const CARD_SHOP_MAX_CHARS: usize = 20;

#[derive(Debug, Parser)]
#[command(name = "stylist", version, about = "AI fashion advice and product picks")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true, default_value = "stylist.toml")]
    config: PathBuf,
    /// Print results as JSON instead of formatted text.
    #[arg(long, global = true)]
    json: bool,
    /// Append pipeline events to this JSONL file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Describe the clothing in a photo.
    Analyze(AnalyzeArgs),
    /// Answer a free-text fashion question.
    Ask(AskArgs),
    /// Analyze a photo and recommend matching products.
    Recommend(RecommendArgs),
    /// Interactive session with slash commands.
    Chat,
    /// Check that configured endpoints are reachable.
    Doctor,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    /// Path to the outfit photo.
    image: PathBuf,
}

#[derive(Debug, Parser)]
struct AskArgs {
    /// The fashion question.
    query: String,
}

#[derive(Debug, Parser)]
struct RecommendArgs {
    /// Path to the outfit photo.
    image: PathBuf,
    /// Also write the product picks as a standalone HTML page.
    #[arg(long)]
    html: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let json_output = cli.json;
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if json_output {
                println!("{}", json!({ "error": format!("{err:#}") }));
            } else {
                eprintln!("stylist error: {err:#}");
            }
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = AppConfig::load(&cli.config)?;
    let events = cli
        .events
        .as_ref()
        .map(|path| EventWriter::with_fresh_session(path));
    let engine = StylistEngine::from_config(&config, events);

    match cli.command {
        Command::Analyze(args) => {
            let analysis = engine.analyze_image(&args.image, AnalysisTask::FashionAnalysis)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                println!("{}", analysis.raw_text.trim());
            }
            Ok(0)
        }
        Command::Ask(args) => {
            let answer = engine.answer_query(&args.query)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print_answer(&answer);
            }
            Ok(0)
        }
        Command::Recommend(args) => {
            let report = engine.analyze_and_recommend(&args.image)?;
            if let Some(html_path) = &args.html {
                let page = render_product_cards_html(&report.product_suggestions.goods);
                fs::write(html_path, page)
                    .with_context(|| format!("failed writing {}", html_path.display()))?;
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(0)
        }
        Command::Chat => {
            run_chat(&engine)?;
            Ok(0)
        }
        Command::Doctor => run_doctor(&config),
    }
}

fn print_answer(answer: &QueryAnswer) {
    println!("{}", answer.analysis.trim());
    if let Some(suggestions) = &answer.recommendations {
        println!();
        print_suggestions(suggestions);
    }
}

fn print_report(report: &OutfitReport) {
    println!("== Photo analysis ==");
    println!("{}", report.image_analysis.trim());
    println!();
    println!("== Styling advice ==");
    println!("{}", report.recommendations.trim());
    println!();
    if !report.search_terms.is_empty() {
        println!("Search terms: {}", report.search_terms.join(", "));
        println!();
    }
    print_suggestions(&report.product_suggestions);
}

fn print_suggestions(suggestions: &AggregatedSuggestions) {
    println!("== Product picks ==");
    if suggestions.goods.is_empty() {
        let reason = suggestions.error.as_deref().unwrap_or("no products found");
        println!("(none: {reason})");
        return;
    }
    for (index, item) in suggestions.goods.iter().enumerate() {
        println!(
            "{}. {}",
            index + 1,
            truncate_chars(&item.name, CARD_NAME_MAX_CHARS)
        );
        print!("   ¥{:.2}", item.price);
        if item.coupon_price > 0.0 && item.coupon_price < item.price {
            print!("  (¥{:.2} with coupon)", item.coupon_price);
        }
        println!("  rating {}  sold {}", rating_text(item.rating_share), item.sales);
        if !item.shop_name.is_empty() {
            println!("   {}", truncate_chars(&item.shop_name, CARD_SHOP_MAX_CHARS));
        }
        let link = if item.detail_url.is_empty() {
            &item.sku_url
        } else {
            &item.detail_url
        };
        if !link.is_empty() {
            println!("   {link}");
        }
    }
}

fn run_chat(engine: &StylistEngine) -> Result<()> {
    println!("stylist chat. Type /help for commands, /quit to exit.");
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match parse_intent(&line) {
            ChatIntent::Quit => break,
            ChatIntent::Noop => continue,
            ChatIntent::Help => println!("{CHAT_HELP}"),
            ChatIntent::Unknown { command } => {
                println!("unknown command /{command}; type /help for the list");
            }
            ChatIntent::Doctor => {
                println!("run `stylist doctor` from the shell for endpoint checks");
            }
            ChatIntent::Ask { query } => match engine.answer_query(&query) {
                Ok(answer) => print_answer(&answer),
                Err(err) => println!("error: {err:#}"),
            },
            ChatIntent::Analyze { path } => {
                match engine.analyze_image(Path::new(&path), AnalysisTask::FashionAnalysis) {
                    Ok(analysis) => println!("{}", analysis.raw_text.trim()),
                    Err(err) => println!("error: {err:#}"),
                }
            }
            ChatIntent::Recommend { path } => {
                match engine.analyze_and_recommend(Path::new(&path)) {
                    Ok(report) => print_report(&report),
                    Err(err) => println!("error: {err:#}"),
                }
            }
        }
    }
    Ok(())
}

fn run_doctor(config: &AppConfig) -> Result<i32> {
    let mut healthy = true;

    let configured = [
        ("text", config.models.text.as_ref()),
        ("vision", config.models.vision.as_ref()),
    ];
    for (role, model) in configured {
        let Some(model) = model else {
            println!("{role} model: not configured");
            continue;
        };
        let client = OllamaClient::new(model);
        match client.list_models() {
            Ok(listings) => {
                let installed = listings.iter().any(|entry| entry.name == client.model());
                if installed {
                    println!("{role} model: {} ok ({})", client.model(), client.base_url());
                } else {
                    println!(
                        "{role} model: endpoint ok but {} is not installed ({})",
                        client.model(),
                        client.base_url()
                    );
                    healthy = false;
                }
            }
            Err(err) => {
                println!("{role} model: unreachable ({err:#})");
                healthy = false;
            }
        }
    }

    match &config.merchant {
        Some(merchant) if merchant.is_usable() => {
            println!("product search: configured ({})", merchant.base_url);
        }
        Some(_) => println!("product search: credentials incomplete, disabled"),
        None => println!("product search: not configured"),
    }

    Ok(if healthy { 0 } else { 1 })
}

fn rating_text(share: f64) -> String {
    if share <= 0.0 {
        "no ratings".to_string()
    } else {
        format!("{:.0}%", share * 100.0)
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for character in value.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Render product picks as a standalone grid of cards. All dynamic text is
/// HTML-escaped; listing URLs come from the merchant API verbatim.
fn render_product_cards_html(goods: &[ProductRecord]) -> String {
    let mut page = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Product picks</title>\n<style>\n\
         body { font-family: sans-serif; background: #f5f5f5; margin: 16px; }\n\
         .grid { display: flex; flex-wrap: wrap; gap: 12px; }\n\
         .card { background: #fff; border-radius: 8px; padding: 12px; width: 220px;\n\
                 box-shadow: 0 1px 3px rgba(0,0,0,0.15); }\n\
         .card img { width: 100%; border-radius: 4px; }\n\
         .name { font-size: 14px; margin: 8px 0 4px; }\n\
         .price { color: #e4393c; font-weight: bold; }\n\
         .coupon { color: #e4393c; font-size: 12px; }\n\
         .meta { color: #888; font-size: 12px; margin-top: 4px; }\n\
         </style>\n</head>\n<body>\n",
    );

    if goods.is_empty() {
        page.push_str("<p>No matching products were found.</p>\n");
    } else {
        page.push_str("<div class=\"grid\">\n");
        for item in goods {
            let link = if item.detail_url.is_empty() {
                &item.sku_url
            } else {
                &item.detail_url
            };
            page.push_str("<div class=\"card\">\n");
            if !item.image_url.is_empty() {
                page.push_str(&format!(
                    "<img src=\"{}\" alt=\"\">\n",
                    escape_html(&item.image_url)
                ));
            }
            page.push_str(&format!(
                "<div class=\"name\">{}</div>\n",
                escape_html(&truncate_chars(&item.name, CARD_NAME_MAX_CHARS))
            ));
            page.push_str(&format!("<div class=\"price\">¥{:.2}</div>\n", item.price));
            if item.coupon_price > 0.0 && item.coupon_price < item.price {
                page.push_str(&format!(
                    "<div class=\"coupon\">¥{:.2} with coupon</div>\n",
                    item.coupon_price
                ));
            }
            page.push_str(&format!(
                "<div class=\"meta\">{} · rating {} · sold {}</div>\n",
                escape_html(&truncate_chars(&item.shop_name, CARD_SHOP_MAX_CHARS)),
                rating_text(item.rating_share),
                item.sales
            ));
            if !link.is_empty() {
                page.push_str(&format!(
                    "<div class=\"meta\"><a href=\"{}\">view listing</a></div>\n",
                    escape_html(link)
                ));
            }
            page.push_str("</div>\n");
        }
        page.push_str("</div>\n");
    }

    page.push_str("</body>\n</html>\n");
    page
}
