/// The placeholder token the image processor expands into image embeddings.
pub const IMAGE_PLACEHOLDER: &str = "<image>";

const PREAMBLE: &str = "A chat between a curious user and an artificial intelligence assistant. \
The assistant gives helpful, detailed, and polite answers to the user's questions.";

/// Conversational template used to wrap a user query.
///
/// The variants are not interchangeable: the turn markers of [`PromptTemplate::ChatTurns`]
/// are special tokens of the instruct tokenizer, while [`PromptTemplate::Freeform`] relies
/// on blank lines only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PromptTemplate {
    /// `<|system|>`, `<|user|>` and `<|assistant|>` delimited turns.
    #[default]
    ChatTurns,
    /// A single block without turn markers.
    Freeform,
}

impl PromptTemplate {
    /// Renders the query into the template. The query is embedded verbatim.
    pub fn render(&self, query: &str) -> String {
        match self {
            PromptTemplate::ChatTurns => format!(
                "<|system|>\n{PREAMBLE}<|end|>\n\
                 <|user|>\n{IMAGE_PLACEHOLDER}\n{query}<|end|>\n\
                 <|assistant|>\n"
            ),
            PromptTemplate::Freeform => {
                format!("\n{PREAMBLE}\n\n{IMAGE_PLACEHOLDER}\n{query}\n\n")
            }
        }
    }
}
