/// Builds the batch prompt asking for the country of each institution.
///
/// Names are listed one per line; the reply must be a bare JSON array with one object per
/// institution, echoing the institution name exactly as given.
pub fn institution_country_prompt(institutions: &[String]) -> String {
    let listing = institutions
        .iter()
        .map(|name| name.replace(['\n', '\r'], " "))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"For each institution or affiliation below, identify the country where it is located.

Institutions (one per line):
{listing}

Classify each country into exactly one of: "United States", "China", "Rest of the World", "Unknown".
Use "Unknown" when the location cannot be determined from the name.

Respond with ONLY a JSON array, no commentary, in this exact format:
[{{"institution": "<name exactly as listed>", "country": "<country name or Unknown>", "uschina": "<category>"}}]"#
    )
}
