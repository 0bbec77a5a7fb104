//! Topic name and filter rules
//!
//! - Names never contain wildcards
//! - `+` occupies a whole level, `#` a whole trailing level
//! - `$share/{group}/{filter}` wraps an ordinary filter
//! - `$`-prefixed names are not matched by a leading wildcard

/// Maximum encoded length of a topic string
const MAX_TOPIC_LEN: usize = 65_535;

const SHARE_PREFIX: &str = "$share/";

/// Validate a topic name carried by PUBLISH. `max_levels` of 0 means no limit.
pub fn validate_topic_name(topic: &str, max_levels: usize) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    if max_levels > 0 && topic.split('/').count() > max_levels {
        return Err("topic exceeds maximum allowed levels");
    }
    Ok(())
}

/// Validate a topic filter carried by SUBSCRIBE or UNSUBSCRIBE
pub fn validate_topic_filter(filter: &str, max_levels: usize) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let inner = if filter.starts_with(SHARE_PREFIX) {
        match parse_shared(filter) {
            Some((_, inner)) => inner,
            None => return Err("invalid shared subscription"),
        }
    } else {
        filter
    };

    let mut levels = inner.split('/').peekable();
    let mut count = 0;
    while let Some(level) = levels.next() {
        count += 1;
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err("multi-level wildcard must be the whole last level");
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    if max_levels > 0 && count > max_levels {
        return Err("topic filter exceeds maximum allowed levels");
    }
    Ok(())
}

/// Split `$share/{group}/{filter}` into group and filter.
///
/// Returns `None` for non-shared filters and for malformed shared ones.
pub fn parse_shared(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix(SHARE_PREFIX)?;
    let (group, inner) = rest.split_once('/')?;
    if group.is_empty() || group.contains(['+', '#']) || inner.is_empty() {
        return None;
    }
    Some((group, inner))
}

pub fn has_wildcards(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

/// Segment-wise match of a topic name against a single filter
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        if level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(t) if level == "+" || level == t => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

/// The subset of `filters` that match `topic`, in input order
pub fn match_filters<'a, I>(topic: &str, filters: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    filters
        .into_iter()
        .filter(|f| topic_matches_filter(topic, f))
        .collect()
}
