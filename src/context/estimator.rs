#[cfg(test)]
#[path = "estimator_test.rs"]
mod tests;

/// Approximates the number of model tokens in `text` without a tokenizer.
///
/// Two estimates are taken, three quarters of a token per word and one token
/// per four characters, and the larger one is rounded up. Characters are
/// counted as Unicode scalar values so the result does not depend on the
/// encoding.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    let chars = text.chars().count();

    // ceil(words * 0.75) and ceil(chars / 4) in integer arithmetic
    let by_words = (words * 3).div_ceil(4);
    let by_chars = chars.div_ceil(4);
    by_words.max(by_chars)
}
