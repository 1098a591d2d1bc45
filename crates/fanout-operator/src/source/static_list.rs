//! The `static` adaptor: items are given verbatim on the ListSource.

/// Returns the configured items unchanged, in order and including duplicates.
pub fn resolve(items: &[String]) -> Vec<String> {
    items.to_vec()
}

#[cfg(test)]
mod tests {
    #[test]
    fn keeps_order_and_duplicates() {
        let items = ["b", "a", "b"].map(String::from);
        assert_eq!(super::resolve(&items), ["b", "a", "b"]);
    }
}
