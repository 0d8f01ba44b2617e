//! Versioned prompt templates
//!
//! Bump the version constant whenever a template's wording changes; the
//! version is recorded with every reformulation so answers can be traced back
//! to the instructions that produced them.

use chrono::NaiveDate;

/// Token replaced with the run date in date-aware templates
pub const DATE_PLACEHOLDER: &str = "{{CURRENT_DATE}}";

pub const REFORMULATION_PROMPT_VERSION: &str = "reformulation/v3";
pub const SYNTHESIS_PROMPT_VERSION: &str = "synthesis/v2";

const REFORMULATION_TEMPLATE: &str = "\
You rewrite questions sent by residents of Timișoara, Romania, to the city's \
public-services assistant. Today's date is {{CURRENT_DATE}}.

Rewrite the question as one precise search query:
- keep the language of the question (usually Romanian);
- name the institution when it is obvious (Primăria, DFMT, Aquatim, Colterm, STPT, ANAF);
- resolve relative dates (\"anul acesta\", \"luna viitoare\") against today's date;
- add the city name if it is missing;
- never answer the question.

Reply with the query only, on a single line, without quotes.";

pub const REGULAR_SEARCH_SYSTEM: &str = "\
Search the web for current, factual information that answers the query for a \
resident of Timișoara, Romania. Prefer official and recent sources. Report \
deadlines, fees, required documents and addresses exactly as published. \
Do not speculate beyond what the sources say.";

pub const TRUSTED_SEARCH_SYSTEM: &str = "\
Search only the official websites you were given. Extract the procedure, \
deadlines, fees, required documents and contact details relevant to the \
query. Quote figures exactly and say which site each fact comes from.";

pub const DOMAIN_SELECTION_SYSTEM: &str = "\
You route questions about public services in Timișoara to official websites. \
Given a query and a list of allowed domains, choose the domains most likely \
to hold the answer. Use only domains from the list. \
Reply with a JSON object of the form {\"domains\": [\"example.ro\"]}.";

const SYNTHESIS_DETAILED_TEMPLATE: &str = "\
You are the public-services assistant of Timișoara. Today's date is {{CURRENT_DATE}}.
Answer in Romanian, using the sources below.

Structure the answer in short sections: what applies to the resident, the \
steps to follow, required documents, deadlines and fees, where to go or whom \
to contact. Cite the source domain next to each fact, e.g. (dfmt.ro). \
If sources disagree, say so. If no source covers a point, say it should be \
checked with the institution. End with a section titled \"Surse:\" listing the \
domains you relied on.";

const SYNTHESIS_COMPACT_TEMPLATE: &str = "\
You are the public-services assistant of Timișoara. Today's date is {{CURRENT_DATE}}.
Answer in Romanian, in one short paragraph of at most three sentences, using \
the sources below. Give only the essential fact or next step. No headings, \
no lists, no source section.";

fn with_date(template: &str, as_of: NaiveDate) -> String {
    template.replace(DATE_PLACEHOLDER, &as_of.format("%d.%m.%Y").to_string())
}

pub fn reformulation_system_prompt(as_of: NaiveDate) -> String {
    with_date(REFORMULATION_TEMPLATE, as_of)
}

pub fn synthesis_system_prompt(detailed: bool, as_of: NaiveDate) -> String {
    if detailed {
        with_date(SYNTHESIS_DETAILED_TEMPLATE, as_of)
    } else {
        with_date(SYNTHESIS_COMPACT_TEMPLATE, as_of)
    }
}

pub fn domain_selection_prompt(query: &str, allowed: &[&str]) -> String {
    format!("Query: {}\nAllowed domains: {}", query, allowed.join(", "))
}
