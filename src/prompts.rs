//! Prompt templates.
//!
//! Every prompt has a built-in template. A Markdown file with the same
//! name in the `prompts/` directory overrides it, so wording can be tuned
//! without rebuilding.

use std::path::PathBuf;

use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_TUPLE_DELIMITER: &str = "<|>";
pub const DEFAULT_RECORD_DELIMITER: &str = "##";
pub const DEFAULT_COMPLETION_DELIMITER: &str = "<|COMPLETE|>";
pub const DEFAULT_LANGUAGE: &str = "English";
pub const DEFAULT_ENTITY_TYPES: [&str; 4] = ["organization", "person", "geo", "event"];

/// Returned whenever no answer can be grounded in the indexed data.
pub const FAIL_RESPONSE: &str = "Sorry, I'm not able to provide an answer to that question.";

/// Available prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    /// Entity and relationship extraction from one chunk.
    EntityExtraction,
    /// Gleaning turn: ask for missed entities.
    EntityContinueExtraction,
    /// Gleaning gate: YES / NO.
    EntityIfLoopExtraction,
    /// Merge several descriptions of one entity or relationship.
    SummarizeEntityDescriptions,
    /// High-level / low-level keyword JSON for a query.
    KeywordsExtraction,
    /// Final answer over the graph context tables.
    RagResponse,
    /// Final answer over raw chunks.
    NaiveRagResponse,
}

impl Prompt {
    /// Override file name (Markdown).
    pub fn filename(&self) -> &'static str {
        match self {
            Prompt::EntityExtraction => "entity_extraction.md",
            Prompt::EntityContinueExtraction => "entity_continue_extraction.md",
            Prompt::EntityIfLoopExtraction => "entity_if_loop_extraction.md",
            Prompt::SummarizeEntityDescriptions => "summarize_entity_descriptions.md",
            Prompt::KeywordsExtraction => "keywords_extraction.md",
            Prompt::RagResponse => "rag_response.md",
            Prompt::NaiveRagResponse => "naive_rag_response.md",
        }
    }

    /// Built-in template.
    pub fn template(&self) -> &'static str {
        match self {
            Prompt::EntityExtraction => ENTITY_EXTRACTION,
            Prompt::EntityContinueExtraction => ENTITY_CONTINUE_EXTRACTION,
            Prompt::EntityIfLoopExtraction => ENTITY_IF_LOOP_EXTRACTION,
            Prompt::SummarizeEntityDescriptions => SUMMARIZE_ENTITY_DESCRIPTIONS,
            Prompt::KeywordsExtraction => KEYWORDS_EXTRACTION,
            Prompt::RagResponse => RAG_RESPONSE,
            Prompt::NaiveRagResponse => NAIVE_RAG_RESPONSE,
        }
    }

    /// Override file if present, built-in template otherwise.
    pub fn load(&self) -> String {
        match load_prompt(self.filename()) {
            Ok(text) => {
                debug!(prompt = self.filename(), "Using prompt override");
                text
            }
            Err(_) => self.template().to_string(),
        }
    }
}

/// Load a prompt file by name.
pub fn load_prompt(filename: &str) -> Result<String> {
    let path = prompts_dir().join(filename);
    std::fs::read_to_string(&path)
        .map_err(|e| Error::InvalidArgument(format!("Failed to load prompt {}: {}", filename, e)))
}

/// Prompt override directory.
pub fn prompts_dir() -> PathBuf {
    let candidates = [
        PathBuf::from("prompts"),
        PathBuf::from("../prompts"),
        PathBuf::from("../../prompts"),
    ];

    for path in candidates {
        if path.exists() {
            return path;
        }
    }

    PathBuf::from("prompts")
}

/// Replace each `{key}` placeholder. Unknown placeholders and other
/// braces are left untouched.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// Few-shot extraction examples, at most `limit`, written with the same
/// delimiters the model is asked to use.
pub fn entity_extraction_examples(
    limit: Option<usize>,
    tuple_delimiter: &str,
    record_delimiter: &str,
    completion_delimiter: &str,
) -> String {
    let take = limit.unwrap_or(ENTITY_EXTRACTION_EXAMPLES.len());
    let joined = ENTITY_EXTRACTION_EXAMPLES
        .iter()
        .take(take)
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    render(
        &joined,
        &[
            ("tuple_delimiter", tuple_delimiter),
            ("record_delimiter", record_delimiter),
            ("completion_delimiter", completion_delimiter),
        ],
    )
}

/// Few-shot keyword examples, at most `limit`.
pub fn keywords_extraction_examples(limit: Option<usize>) -> String {
    let take = limit.unwrap_or(KEYWORDS_EXTRACTION_EXAMPLES.len());
    KEYWORDS_EXTRACTION_EXAMPLES
        .iter()
        .take(take)
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

const ENTITY_EXTRACTION: &str = r#"-Goal-
Given a text document that is potentially relevant to this activity and a list of entity types, identify all entities of those types from the text and all relationships among the identified entities.
Use {language} as output language.

-Steps-
1. Identify all entities. For each identified entity, extract the following information:
- entity_name: Name of the entity, use same language as input text. If English, capitalize the name.
- entity_type: One of the following types: [{entity_types}]
- entity_description: Comprehensive description of the entity's attributes and activities
Format each entity as ("entity"{tuple_delimiter}<entity_name>{tuple_delimiter}<entity_type>{tuple_delimiter}<entity_description>)

2. From the entities identified in step 1, identify all pairs of (source_entity, target_entity) that are *clearly related* to each other.
For each pair of related entities, extract the following information:
- source_entity: name of the source entity, as identified in step 1
- target_entity: name of the target entity, as identified in step 1
- relationship_description: explanation as to why you think the source entity and the target entity are related to each other
- relationship_keywords: one or more high-level key words that summarize the overarching nature of the relationship, focusing on concepts or themes rather than specific details
- relationship_strength: a numeric score indicating strength of the relationship between the source entity and target entity
Format each relationship as ("relationship"{tuple_delimiter}<source_entity>{tuple_delimiter}<target_entity>{tuple_delimiter}<relationship_description>{tuple_delimiter}<relationship_keywords>{tuple_delimiter}<relationship_strength>)

3. Identify high-level key words that summarize the main concepts, themes, or topics of the entire text.
Format the content-level key words as ("content_keywords"{tuple_delimiter}<high_level_keywords>)

4. Return output in {language} as a single list of all the entities and relationships identified in steps 1 and 2. Use **{record_delimiter}** as the list delimiter.

5. When finished, output {completion_delimiter}

######################
-Examples-
######################
{examples}

#############################
-Real Data-
######################
Entity_types: {entity_types}
Text: {input_text}
######################
Output:"#;

const ENTITY_EXTRACTION_EXAMPLES: [&str; 2] = [
    r#"Example 1:

Entity_types: [organization, person, geo, event]
Text:
Tim Cook announced that Apple will open a new research campus in Austin. The campus will focus on chip design, an area where Apple competes with Microsoft for engineering talent.
################
Output:
("entity"{tuple_delimiter}"Tim Cook"{tuple_delimiter}"person"{tuple_delimiter}"Tim Cook is the executive who announced Apple's new research campus."){record_delimiter}
("entity"{tuple_delimiter}"Apple"{tuple_delimiter}"organization"{tuple_delimiter}"Apple is a technology company opening a research campus focused on chip design."){record_delimiter}
("entity"{tuple_delimiter}"Austin"{tuple_delimiter}"geo"{tuple_delimiter}"Austin is the city where Apple's new research campus will be located."){record_delimiter}
("entity"{tuple_delimiter}"Microsoft"{tuple_delimiter}"organization"{tuple_delimiter}"Microsoft is a technology company competing with Apple for engineering talent."){record_delimiter}
("relationship"{tuple_delimiter}"Tim Cook"{tuple_delimiter}"Apple"{tuple_delimiter}"Tim Cook speaks for Apple when announcing the campus."{tuple_delimiter}"leadership, announcement"{tuple_delimiter}8){record_delimiter}
("relationship"{tuple_delimiter}"Apple"{tuple_delimiter}"Austin"{tuple_delimiter}"Apple is building its research campus in Austin."{tuple_delimiter}"expansion, location"{tuple_delimiter}7){record_delimiter}
("relationship"{tuple_delimiter}"Apple"{tuple_delimiter}"Microsoft"{tuple_delimiter}"Apple and Microsoft compete for chip design engineers."{tuple_delimiter}"competition, talent"{tuple_delimiter}6){record_delimiter}
("content_keywords"{tuple_delimiter}"corporate expansion, chip design, talent competition"){completion_delimiter}
#############################"#,
    r#"Example 2:

Entity_types: [organization, person, geo, event]
Text:
The Central Institution will meet on Thursday to decide interest rates. Analysts expect Governor Lina Ortiz to hold rates steady after the Spring Summit in Verdantis.
################
Output:
("entity"{tuple_delimiter}"Central Institution"{tuple_delimiter}"organization"{tuple_delimiter}"The Central Institution sets interest rates and meets on Thursday."){record_delimiter}
("entity"{tuple_delimiter}"Lina Ortiz"{tuple_delimiter}"person"{tuple_delimiter}"Lina Ortiz is the governor expected to hold interest rates steady."){record_delimiter}
("entity"{tuple_delimiter}"Spring Summit"{tuple_delimiter}"event"{tuple_delimiter}"The Spring Summit is a meeting held in Verdantis before the rate decision."){record_delimiter}
("entity"{tuple_delimiter}"Verdantis"{tuple_delimiter}"geo"{tuple_delimiter}"Verdantis is the location of the Spring Summit."){record_delimiter}
("relationship"{tuple_delimiter}"Lina Ortiz"{tuple_delimiter}"Central Institution"{tuple_delimiter}"Lina Ortiz governs the Central Institution."{tuple_delimiter}"governance, monetary policy"{tuple_delimiter}9){record_delimiter}
("relationship"{tuple_delimiter}"Spring Summit"{tuple_delimiter}"Verdantis"{tuple_delimiter}"The Spring Summit takes place in Verdantis."{tuple_delimiter}"event location"{tuple_delimiter}5){record_delimiter}
("content_keywords"{tuple_delimiter}"monetary policy, interest rates, central banking"){completion_delimiter}
#############################"#,
];

const ENTITY_CONTINUE_EXTRACTION: &str =
    "MANY entities were missed in the last extraction. Add them below using the same format:";

const ENTITY_IF_LOOP_EXTRACTION: &str = "It appears some entities may have still been missed. Answer YES | NO if there are still entities that need to be added.";

const SUMMARIZE_ENTITY_DESCRIPTIONS: &str = r#"You are a helpful assistant responsible for generating a comprehensive summary of the data provided below.
Given one or two entities, and a list of descriptions, all related to the same entity or group of entities.
Please concatenate all of these into a single, comprehensive description. Make sure to include information collected from all the descriptions.
If the provided descriptions are contradictory, please resolve the contradictions and provide a single, coherent summary.
Make sure it is written in third person, and include the entity names so we have the full context.
Use {language} as output language.

#######
-Data-
Entities: {entity_name}
Description List: {description_list}
#######
Output:"#;

const KEYWORDS_EXTRACTION: &str = r#"---Role---

You are a helpful assistant tasked with identifying both high-level and low-level keywords in the user's query.
Use {language} as output language.

---Goal---

Given the query, list both high-level and low-level keywords. High-level keywords focus on overarching concepts or themes, while low-level keywords focus on specific entities, details, or concrete terms.

---Instructions---

- Output the keywords in JSON format.
- The JSON should have two keys:
  - "high_level_keywords" for overarching concepts or themes.
  - "low_level_keywords" for specific entities or details.

######################
-Examples-
######################
{examples}

#############################
-Real Data-
######################
Query: {query}
######################
The `Output` should be human text, not unicode characters. Keep the same language as `Query`.
Output:"#;

const KEYWORDS_EXTRACTION_EXAMPLES: [&str; 3] = [
    r#"Example 1:

Query: "How does international trade influence global economic stability?"
################
Output:
{
  "high_level_keywords": ["International trade", "Global economic stability", "Economic impact"],
  "low_level_keywords": ["Trade agreements", "Tariffs", "Currency exchange", "Imports", "Exports"]
}
#############################"#,
    r#"Example 2:

Query: "What are the environmental consequences of deforestation on biodiversity?"
################
Output:
{
  "high_level_keywords": ["Environmental consequences", "Deforestation", "Biodiversity loss"],
  "low_level_keywords": ["Species extinction", "Habitat destruction", "Carbon emissions", "Rainforest", "Ecosystem"]
}
#############################"#,
    r#"Example 3:

Query: "What is the role of education in reducing poverty?"
################
Output:
{
  "high_level_keywords": ["Education", "Poverty reduction", "Socioeconomic development"],
  "low_level_keywords": ["School access", "Literacy rates", "Job training", "Income inequality"]
}
#############################"#,
];

const RAG_RESPONSE: &str = r#"---Role---

You are a helpful assistant responding to questions about data in the tables provided.

---Goal---

Generate a response of the target length and format that responds to the user's question, summarizing all information in the input data tables appropriate for the response length and format, and incorporating any relevant general knowledge.
If you don't know the answer, just say so. Do not make anything up.
Do not include information where the supporting evidence for it is not provided.

---Target response length and format---

{response_type}

---Data tables---

{context_data}

Add sections and commentary to the response as appropriate for the length and format. Style the response in markdown."#;

const NAIVE_RAG_RESPONSE: &str = r#"---Role---

You are a helpful assistant responding to questions about documents provided.

---Goal---

Generate a response of the target length and format that responds to the user's question, summarizing all information in the input data tables appropriate for the response length and format, and incorporating any relevant general knowledge.
If you don't know the answer, just say so. Do not make anything up.
Do not include information where the supporting evidence for it is not provided.

---Target response length and format---

{response_type}

---Documents---

{content_data}

Add sections and commentary to the response as appropriate for the length and format. Style the response in markdown."#;
