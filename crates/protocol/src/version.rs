use std::cmp::Ordering;

/// Compares dot-separated version strings component by component.
///
/// Missing and non-numeric components count as zero, so `"1.2"` equals
/// `"1.2.0"` and `"1.x"` equals `"1.0"`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .trim_start_matches(['v', 'V'])
            .split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Returns true when `remote` is strictly newer than `local`.
pub fn is_newer(remote: &str, local: &str) -> bool {
    compare_versions(remote, local) == Ordering::Greater
}
