use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One result row keyed by column name, as handed to the model.
pub type InventoryRow = serde_json::Map<String, serde_json::Value>;

/// Bumped whenever `INVENTORY_SCHEMA` and the `cars` migration change together.
pub const INVENTORY_SCHEMA_VERSION: u32 = 1;

/// Schema text embedded in the query-generation prompt. Must describe the
/// `cars` table exactly as migrated.
pub const INVENTORY_SCHEMA: &str = "CREATE TABLE cars (
    uuid TEXT PRIMARY KEY,
    vin TEXT,
    stock_number TEXT,
    make TEXT,
    model TEXT,
    trim TEXT,
    model_code TEXT,
    year INTEGER,
    model_year INTEGER,
    body_style TEXT,
    classification TEXT,
    doors TEXT,
    drive_line TEXT,
    transmission TEXT,
    fuel_type TEXT,
    normal_fuel_type TEXT,
    exterior_color TEXT,
    interior_color TEXT,
    odometer INTEGER,
    new_or_used TEXT,
    certified BOOLEAN,
    inventory_type TEXT,
    inventory_date DATE,
    option_codes TEXT,
    asking_price TEXT,
    sale_price TEXT,
    pricing_internet_price TEXT,
    pricing_final_price TEXT,
    link TEXT,
    account_id TEXT,
    address_account_name TEXT,
    address_city TEXT,
    address_state TEXT,
    address_country TEXT,
    address_postal_code TEXT
)";

/// Column names declared by `INVENTORY_SCHEMA`, in declaration order.
pub fn inventory_columns() -> Vec<&'static str> {
    let Some(start) = INVENTORY_SCHEMA.find('(') else {
        return Vec::new();
    };
    let body = INVENTORY_SCHEMA[start + 1..].trim_end().trim_end_matches(')');
    body.split(',').filter_map(|line| line.split_whitespace().next()).collect()
}

/// A vehicle listing as stored in the `cars` table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarListing {
    pub uuid: String,
    pub vin: Option<String>,
    pub stock_number: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub model_code: Option<String>,
    pub year: Option<i64>,
    pub model_year: Option<i64>,
    pub body_style: Option<String>,
    pub classification: Option<String>,
    pub doors: Option<String>,
    pub drive_line: Option<String>,
    pub transmission: Option<String>,
    pub fuel_type: Option<String>,
    pub normal_fuel_type: Option<String>,
    pub exterior_color: Option<String>,
    pub interior_color: Option<String>,
    pub odometer: Option<i64>,
    pub new_or_used: Option<String>,
    pub certified: Option<bool>,
    pub inventory_type: Option<String>,
    pub inventory_date: Option<String>,
    pub option_codes: Vec<String>,
    pub asking_price: Option<String>,
    pub sale_price: Option<String>,
    pub pricing_internet_price: Option<String>,
    pub pricing_final_price: Option<String>,
    pub link: Option<String>,
    pub account_id: Option<String>,
    pub address_account_name: Option<String>,
    pub address_city: Option<String>,
    pub address_state: Option<String>,
    pub address_country: Option<String>,
    pub address_postal_code: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReadOnlyViolation {
    #[error("query text is empty")]
    Empty,
    #[error("query must start with SELECT or WITH, found `{0}`")]
    NotSelect(String),
    #[error("query contains more than one statement")]
    MultipleStatements,
    #[error("query contains forbidden keyword `{0}`")]
    ForbiddenKeyword(String),
}

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "attach", "detach", "pragma",
    "vacuum", "reindex", "conflict", "upsert",
];

/// Accepts only a single SELECT-shaped statement. Keywords inside string
/// literals, quoted identifiers and comments are ignored.
pub fn ensure_read_only(query: &str) -> Result<(), ReadOnlyViolation> {
    let code = strip_literals_and_comments(query);
    let statement = code.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if statement.is_empty() {
        return Err(ReadOnlyViolation::Empty);
    }
    if statement.contains(';') {
        return Err(ReadOnlyViolation::MultipleStatements);
    }

    let words: Vec<String> = statement
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();

    match words.first().map(String::as_str) {
        Some("select") | Some("with") => {}
        Some(other) => return Err(ReadOnlyViolation::NotSelect(other.to_string())),
        None => return Err(ReadOnlyViolation::Empty),
    }

    if let Some(keyword) = words.iter().find(|word| FORBIDDEN_KEYWORDS.contains(&word.as_str())) {
        return Err(ReadOnlyViolation::ForbiddenKeyword(keyword.clone()));
    }

    // `replace(...)` is also a string function, only `REPLACE INTO` writes
    if words.windows(2).any(|pair| pair[0] == "replace" && pair[1] == "into") {
        return Err(ReadOnlyViolation::ForbiddenKeyword("replace".to_string()));
    }

    Ok(())
}

fn strip_literals_and_comments(query: &str) -> String {
    let mut output = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' | '`' => {
                let quote = ch;
                while let Some(next) = chars.next() {
                    if next == quote {
                        // doubled quote is an escaped quote inside the literal
                        if chars.peek() == Some(&quote) {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                }
                output.push(' ');
            }
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
                output.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                output.push(' ');
            }
            _ => output.push(ch),
        }
    }

    output
}
