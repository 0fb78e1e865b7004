use std::collections::BTreeMap;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use url::Url;

use super::{
    Agent, AgentCapability, AgentError, AgentInput, AgentType, ArtifactDraft,
    schema::{schema_value, validate_input},
    types::{BookmarkBatch, BookmarkRecord},
};
use crate::services::progress::ProgressReporter;

pub const ARTIFACT_TYPE: &str = "categorization_report";
pub const FALLBACK_CATEGORY: &str = "Other";
const MAX_LABELS: usize = 3;

struct Category {
    name: &'static str,
    /// Host patterns. `host/path` also constrains the path; a trailing `.`
    /// matches an address prefix.
    domains: &'static [&'static str],
    keywords: &'static [&'static str],
}

const TAXONOMY: &[Category] = &[
    Category {
        name: "AI_and_ML",
        domains: &[
            "openai.com", "anthropic.com", "claude.ai", "chatgpt.com", "perplexity.ai",
            "character.ai", "midjourney.com", "stability.ai", "huggingface.co",
            "replicate.com", "cohere.ai", "scale.ai", "wandb.ai", "roboflow.com",
            "kaggle.com", "paperswithcode.com", "bard.google.com", "gemini.google.com",
            "ai.google", "deepmind.com",
        ],
        keywords: &[
            "ai", "artificial-intelligence", "machine-learning", "deep-learning", "neural",
            "gpt", "llm", "transformer", "diffusion",
        ],
    },
    Category {
        name: "Development_and_Tech",
        domains: &[
            "github.com", "gitlab.com", "bitbucket.org", "stackoverflow.com", "docker.com",
            "kubernetes.io", "terraform.io", "jenkins.io", "circleci.com", "travis-ci.org",
            "heroku.com", "vercel.com", "netlify.com", "digitalocean.com", "linode.com",
            "vultr.com", "crates.io", "docs.rs",
        ],
        keywords: &[
            "api", "sdk", "framework", "library", "package", "module", "repository", "code",
            "programming", "development",
        ],
    },
    Category {
        name: "Cloud_and_DevOps",
        domains: &[
            "aws.amazon.com", "cloud.google.com", "azure.microsoft.com", "portal.azure.com",
            "cloud.ibm.com", "oracle.com/cloud", "alibabacloud.com", "datadog.com",
            "newrelic.com", "splunk.com", "elastic.co", "grafana.com",
        ],
        keywords: &[
            "cloud", "devops", "infrastructure", "monitoring", "logging", "metrics",
            "observability", "container", "orchestration",
        ],
    },
    Category {
        name: "Google_Services",
        domains: &[
            "docs.google.com", "drive.google.com", "mail.google.com", "calendar.google.com",
            "meet.google.com", "sites.google.com", "sheets.google.com", "slides.google.com",
            "forms.google.com", "keep.google.com", "photos.google.com", "contacts.google.com",
        ],
        keywords: &["google-docs", "google-drive", "gmail", "google-calendar"],
    },
    Category {
        name: "News_and_Media",
        domains: &[
            "nytimes.com", "wsj.com", "washingtonpost.com", "bloomberg.com", "reuters.com",
            "apnews.com", "bbc.com", "bbc.co.uk", "cnn.com", "foxnews.com", "theguardian.com",
            "economist.com", "ft.com", "politico.com", "thehill.com", "axios.com", "vox.com",
            "vice.com", "buzzfeed.com", "huffpost.com", "dailymail.co.uk", "usatoday.com",
            "forbes.com", "businessinsider.com", "fortune.com", "cnbc.com", "marketwatch.com",
        ],
        keywords: &["news", "article", "report", "analysis", "opinion", "editorial"],
    },
    Category {
        name: "Tech_News_and_Blogs",
        domains: &[
            "techcrunch.com", "theverge.com", "wired.com", "arstechnica.com", "engadget.com",
            "gizmodo.com", "mashable.com", "venturebeat.com", "zdnet.com", "cnet.com",
            "thenextweb.com", "news.ycombinator.com", "slashdot.org", "techdirt.com",
            "anandtech.com", "tomshardware.com", "bleepingcomputer.com",
        ],
        keywords: &["tech-news", "technology", "gadget", "startup", "innovation"],
    },
    Category {
        name: "Social_and_Professional",
        domains: &[
            "linkedin.com", "twitter.com", "x.com", "facebook.com", "instagram.com",
            "reddit.com", "pinterest.com", "tumblr.com", "discord.com", "slack.com",
            "teams.microsoft.com", "mastodon.social",
        ],
        keywords: &["social", "network", "community", "forum", "discussion"],
    },
    Category {
        name: "Learning_and_Education",
        domains: &[
            "coursera.org", "udemy.com", "edx.org", "udacity.com", "khanacademy.org",
            "pluralsight.com", "skillshare.com", "masterclass.com", "brilliant.org",
            "codecademy.com", "datacamp.com", "freecodecamp.org", "w3schools.com",
            "tutorialspoint.com", "geeksforgeeks.org", "leetcode.com", "hackerrank.com",
        ],
        keywords: &["tutorial", "course", "learn", "education", "training", "certification"],
    },
    Category {
        name: "Documentation_and_Reference",
        domains: &[
            "docs.python.org", "developer.mozilla.org", "devdocs.io", "cppreference.com",
            "php.net", "ruby-doc.org", "golang.org/doc", "go.dev/doc", "rust-lang.org/learn",
            "doc.rust-lang.org", "docs.oracle.com", "docs.microsoft.com", "learn.microsoft.com",
            "developer.apple.com", "developer.android.com",
        ],
        keywords: &["documentation", "reference", "manual", "guide", "specification", "docs"],
    },
    Category {
        name: "Research_and_Academic",
        domains: &[
            "arxiv.org", "scholar.google.com", "nature.com", "science.org",
            "sciencedirect.com", "springer.com", "wiley.com", "pubmed.ncbi.nlm.nih.gov",
            "jstor.org", "acm.org", "ieee.org", "researchgate.net", "academia.edu",
            "semanticscholar.org", "biorxiv.org", "ssrn.com",
        ],
        keywords: &["research", "paper", "study", "journal", "publication", "academic"],
    },
    Category {
        name: "Shopping_and_E-commerce",
        domains: &[
            "amazon.com", "ebay.com", "etsy.com", "alibaba.com", "walmart.com", "target.com",
            "bestbuy.com", "costco.com", "homedepot.com", "lowes.com", "wayfair.com",
            "overstock.com", "newegg.com", "shopify.com", "squarespace.com",
            "woocommerce.com",
        ],
        keywords: &["shop", "store", "buy", "purchase", "product", "marketplace"],
    },
    Category {
        name: "Entertainment_and_Media",
        domains: &[
            "youtube.com", "youtu.be", "netflix.com", "hulu.com", "disneyplus.com",
            "hbomax.com", "primevideo.com", "spotify.com", "soundcloud.com", "twitch.tv",
            "vimeo.com", "dailymotion.com", "tiktok.com", "imdb.com", "rottentomatoes.com",
            "metacritic.com",
        ],
        keywords: &["video", "music", "movie", "show", "stream", "entertainment"],
    },
    Category {
        name: "Business_and_Finance",
        domains: &[
            "chase.com", "bankofamerica.com", "wellsfargo.com", "citi.com",
            "americanexpress.com", "paypal.com", "venmo.com", "square.com", "stripe.com",
            "quickbooks.intuit.com", "fidelity.com", "vanguard.com", "schwab.com",
            "etrade.com", "robinhood.com", "coinbase.com", "binance.com", "kraken.com",
        ],
        keywords: &["finance", "banking", "investment", "trading", "payment", "crypto"],
    },
    Category {
        name: "Productivity_and_Tools",
        domains: &[
            "notion.so", "evernote.com", "todoist.com", "trello.com", "asana.com",
            "monday.com", "clickup.com", "airtable.com", "zapier.com", "ifttt.com",
            "calendly.com", "doodle.com", "grammarly.com", "canva.com", "figma.com",
            "miro.com",
        ],
        keywords: &["productivity", "tool", "workflow", "automation", "collaboration"],
    },
    Category {
        name: "Sailing_and_Marine",
        domains: &[
            "yachtworld.com", "boats.com", "boattrader.com", "marinetraffic.com", "windy.com",
            "sailingmagazine.net", "cruisingworld.com", "yachtingmagazine.com",
            "practical-sailor.com", "boatus.com", "westmarine.com",
            "landfall-navigation.com", "defender.com", "smallboatsmonthly.com",
            "woodenboat.com", "classicboat.co.uk",
        ],
        keywords: &["sailing", "boat", "yacht", "marine", "nautical", "vessel", "harbor"],
    },
    Category {
        name: "Local_and_Development",
        domains: &["localhost", "127.0.0.1", "0.0.0.0", "192.168.", "10.0."],
        keywords: &["localhost", "staging"],
    },
];

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct CategorizationReport {
    pub bookmarks: Vec<BookmarkRecord>,
    pub category_counts: BTreeMap<String, usize>,
    pub uncategorized: usize,
}

fn domain_matches(pattern: &str, host: &str, path: &str) -> bool {
    if let Some((pattern_host, pattern_path)) = pattern.split_once('/') {
        return domain_matches(pattern_host, host, path)
            && path.trim_start_matches('/').starts_with(pattern_path);
    }
    if pattern.ends_with('.') {
        return host.starts_with(pattern);
    }
    host == pattern
        || host
            .strip_suffix(pattern)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Assigns up to three labels. Host matches win over keyword matches.
pub fn categorize(record: &BookmarkRecord) -> Vec<String> {
    let parsed = Url::parse(record.url.trim()).ok();
    let host = record
        .domain
        .clone()
        .or_else(|| parsed.as_ref().and_then(|u| u.host_str().map(String::from)))
        .unwrap_or_default()
        .to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let path = parsed
        .as_ref()
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_default();

    let by_domain: Vec<String> = TAXONOMY
        .iter()
        .filter(|c| c.domains.iter().any(|d| domain_matches(d, host, &path)))
        .take(MAX_LABELS)
        .map(|c| c.name.to_string())
        .collect();
    if !by_domain.is_empty() {
        return by_domain;
    }

    let mut words: Vec<String> = tokens(&path).collect();
    words.extend(tokens(&record.title));
    for part in record.folder_path.iter().chain(record.tags.iter()) {
        words.extend(tokens(part));
    }
    // Hyphenated keywords match consecutive tokens.
    let joined = format!("-{}-", words.join("-"));

    let by_keyword: Vec<String> = TAXONOMY
        .iter()
        .filter(|c| {
            c.keywords
                .iter()
                .any(|k| joined.contains(&format!("-{k}-")))
        })
        .take(MAX_LABELS)
        .map(|c| c.name.to_string())
        .collect();
    if by_keyword.is_empty() {
        vec![FALLBACK_CATEGORY.to_string()]
    } else {
        by_keyword
    }
}

/// Rule-based categorization over a fixed taxonomy.
#[derive(Default)]
pub struct CategorizationAgent;

impl CategorizationAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Agent for CategorizationAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Categorization
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent_type: AgentType::Categorization,
            version: "1.0.0".to_string(),
            description: "Labels bookmarks by known hosts and title/path keywords".to_string(),
            input_schema: schema_value::<BookmarkBatch>(),
            output_schema: schema_value::<CategorizationReport>(),
            output_artifact_type: ARTIFACT_TYPE.to_string(),
        }
    }

    fn validate(&self, input: &Value) -> Result<(), AgentError> {
        validate_input::<BookmarkBatch>(input).map(|_| ())
    }

    async fn process(
        &self,
        input: AgentInput,
        reporter: &ProgressReporter,
    ) -> Result<ArtifactDraft, AgentError> {
        let batch = validate_input::<BookmarkBatch>(&input.payload)?;
        let total = batch.bookmarks.len();

        let mut category_counts = BTreeMap::new();
        let mut uncategorized = 0;
        let mut bookmarks = Vec::with_capacity(total);
        for (idx, mut record) in batch.bookmarks.into_iter().enumerate() {
            record.ensure_hash();
            record.categories = categorize(&record);
            if record.categories == [FALLBACK_CATEGORY] {
                uncategorized += 1;
            }
            for label in &record.categories {
                *category_counts.entry(label.clone()).or_insert(0) += 1;
            }
            bookmarks.push(record);
            if (idx + 1) % 500 == 0 {
                reporter.items("Categorized bookmarks", idx + 1, total).await;
            }
        }

        reporter
            .message(format!(
                "Categorized {total} bookmarks into {} categories",
                category_counts.len()
            ))
            .await;

        ArtifactDraft::from_output(
            ARTIFACT_TYPE,
            &CategorizationReport {
                bookmarks,
                category_counts,
                uncategorized,
            },
        )
    }
}
