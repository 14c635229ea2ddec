use crate::models::Hotel;

/// Collapse text onto a single line: every line is trimmed, blank lines are dropped and the
/// rest are joined with single spaces.
pub fn one_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The completion prompt for one hotel.
pub fn recommendation_prompt(question: &str, hotel: &Hotel) -> String {
    one_line(&format!(
        r#"
        You are a friendly and professional travel agent trying to convince a customer to stay at the hotel given in the context.
        Write a recommendation for the hotel in the context, for the customer wanting to know """{question}""".
        The recommendation must be exactly 3 sentences long. The tone should be fun, exciting and tailored to the customer's question.
        Do not use the term 'perfect' in the first sentence of the recommendation.

        Context
        -------
        {name}.{description}
        "#,
        name = hotel.name,
        description = hotel.description,
    ))
}

/// One prompt per hotel, in hotel order. Prompt `i` becomes slot `i` of the stream.
pub fn create_prompts(question: &str, hotels: &[Hotel]) -> Vec<String> {
    hotels
        .iter()
        .map(|hotel| recommendation_prompt(question, hotel))
        .collect()
}
