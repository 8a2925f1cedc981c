//! `granule-watch classify`

use std::path::Path;

use serde_json::json;

use crate::identity::IdentityExtractor;

/// Print one line per name. Returns the number of names that did not classify.
pub fn run(extractor: &IdentityExtractor, names: &[String], as_json: bool) -> usize {
    let mut failures = 0;
    for line in render(extractor, names, as_json) {
        if line.is_err() {
            failures += 1;
        }
        match line {
            Ok(text) => println!("{text}"),
            Err(text) => eprintln!("{text}"),
        }
    }
    failures
}

/// Classification lines for `names`; `Err` holds the line for a failure.
pub fn render(
    extractor: &IdentityExtractor,
    names: &[String],
    as_json: bool,
) -> Vec<Result<String, String>> {
    names
        .iter()
        .map(|name| {
            let result = extractor.classify_path(Path::new(name));
            match (result, as_json) {
                (Ok(class), false) => Ok(format!("{name}\t{}\t{}", class.type_name, class.granule_id)),
                (Ok(class), true) => {
                    Ok(json!({ "name": name, "type": class.type_name, "id": class.granule_id })
                        .to_string())
                }
                (Err(e), false) => Err(format!("{name}\terror: {e}")),
                (Err(e), true) => Err(json!({ "name": name, "error": e.to_string() }).to_string()),
            }
        })
        .collect()
}
