//! Syllable-matched replacement library.
//!
//! Replacements are deterministic: the first candidate for a word always
//! matches its syllable count so the substituted caption scans naturally.
//! A parallel "silly" table offers more expressive options, and unknown
//! words fall back to generic buckets keyed by estimated syllable count.

/// Syllable count and ordered candidates for a known word. The first
/// candidate is the syllable-matched primary.
pub fn syllable_replacements(word: &str) -> Option<(usize, &'static [&'static str])> {
    let entry: (usize, &'static [&'static str]) = match word {
        // 1-syllable words
        "ass" => (1, &["butt", "rear", "tush", "rump"]),
        "damn" => (1, &["dang", "darn", "shoot", "rats"]),
        "hell" => (1, &["heck", "flip"]),
        "shit" => (1, &["crap", "crud", "shoot", "drat"]),
        "fuck" => (1, &["fudge", "flip", "frick", "frig"]),
        "dick" => (1, &["jerk", "dork", "fool"]),
        "cock" => (1, &["jerk", "fool", "dork"]),
        "cunt" => (1, &["jerk", "fool", "meanie"]),
        "slut" => (1, &["jerk", "fool"]),
        "whore" => (1, &["jerk", "fool"]),
        "bitch" => (1, &["witch", "jerk"]),
        "piss" => (1, &["ticked", "mad"]),
        "crap" => (1, &["crud", "stuff", "junk"]),
        "arse" => (1, &["rear", "butt"]),
        "prick" => (1, &["jerk", "fool"]),
        "twat" => (1, &["fool", "jerk"]),
        "fucked" => (1, &["messed", "ruined"]),
        "screwed" => (1, &["messed"]),
        "pissed" => (1, &["ticked", "miffed"]),

        // 2-syllable words
        "asshole" => (2, &["jerkwad", "meanie", "butthead"]),
        "bastard" => (2, &["meanie", "rascal", "scoundrel"]),
        "bullshit" => (2, &["nonsense", "baloney", "hogwash", "rubbish"]),
        "dammit" => (2, &["dang it", "darn it", "shoot it"]),
        "damnit" => (2, &["dang it", "darn it"]),
        "goddamn" => (2, &["gosh darn", "dog gone"]),
        "shitty" => (2, &["crummy", "lousy", "crappy"]),
        "shittin" => (2, &["fibbin", "messin"]),
        "shitting" => (2, &["fibbing", "messing"]),
        "fucking" => (2, &["freaking", "flipping", "fricking"]),
        "fuckin" => (2, &["freakin", "flippin", "frickin"]),
        "fucker" => (2, &["meanie", "stinker", "jerkwad"]),
        "fuckers" => (2, &["meanies", "stinkers", "jerkwads"]),
        "bitchy" => (2, &["grumpy", "cranky", "snippy"]),
        "bitchin" => (2, &["awesome", "wicked"]),
        "badass" => (2, &["awesome", "cool cat"]),
        "jackass" => (2, &["dummy", "foolish"]),
        "dumbass" => (2, &["dummy", "silly"]),
        "dipshit" => (2, &["dummy", "dimwit"]),
        "dickhead" => (2, &["jerkwad", "meanie"]),
        "shithead" => (2, &["numbskull", "dummy"]),
        "douche" => (1, &["jerk", "fool"]),
        "douchebag" => (2, &["jerkwad", "meanie"]),

        // 3+ syllables and compounds
        "motherfucker" => (4, &["son of a gun", "goodness gracious"]),
        "motherfucking" => (4, &["flippin' heckin'", "gosh darn awful"]),
        "motherfuckin" => (4, &["flippin' heckin'", "gosh darn"]),
        "goddammit" => (3, &["gosh darn it", "oh my gosh"]),
        "goddamnit" => (3, &["gosh darn it", "oh my gosh"]),
        "sonofabitch" => (4, &["son of a gun", "scoundrel there"]),

        // Religious/blasphemy (context-sensitive, replacements ready anyway)
        "god" => (1, &["gosh"]),
        "jesus" => (2, &["gee whiz", "goodness"]),
        "christ" => (1, &["gosh", "geez"]),

        _ => return None,
    };
    Some(entry)
}

/// Additional silly/fun replacements.
pub fn silly_replacements(word: &str) -> Option<&'static [&'static str]> {
    let list: &'static [&'static str] = match word {
        "hell" => &["H-E-double-hockey-sticks", "heck", "the bad place"],
        "damn" => &["dagnabbit", "gosh darn", "heckin"],
        "shit" => &["shucks", "sugar", "shoot", "shinola"],
        "fuck" => &["fudge", "frick", "frick-frack", "fluffernutter"],
        "ass" => &["behind", "posterior", "bootie", "keister"],
        "bitch" => &["witch", "beach", "mean person"],
        "bastard" => &["scoundrel", "rascal", "rapscallion"],
        "crap" => &["crud", "crumbs", "criminy"],
        _ => return None,
    };
    Some(list)
}

/// Generic fallback buckets keyed by syllable count.
fn syllable_fallbacks(syllables: usize) -> &'static [&'static str] {
    match syllables {
        1 => &["darn", "shoot", "crud", "drat"],
        2 => &["dang it", "oh no", "criminy", "goodness"],
        3 => &["oh my gosh", "goodness me", "dear me"],
        4 => &["goodness gracious", "oh my goodness"],
        _ => &["dang it", "oh no", "criminy", "goodness"],
    }
}

/// Estimate syllable count from vowel groups.
///
/// Subtracts one for a trailing silent `e`, adds one back for `-le` after a
/// consonant (`bottle`), clamps to at least 1.
pub fn count_syllables(word: &str) -> usize {
    let word = word.trim().to_lowercase();
    if word.is_empty() {
        return 0;
    }

    let is_vowel = |c: char| "aeiouy".contains(c);
    let mut count = 0usize;
    let mut prev_was_vowel = false;
    for c in word.chars() {
        let v = is_vowel(c);
        if v && !prev_was_vowel {
            count += 1;
        }
        prev_was_vowel = v;
    }

    if word.ends_with('e') && count > 1 {
        count -= 1;
    }

    let chars: Vec<char> = word.chars().collect();
    if word.ends_with("le") && chars.len() > 2 && !is_vowel(chars[chars.len() - 3]) {
        count += 1;
    }

    count.max(1)
}

/// Deterministic replacement for `word` (lowercase), syllable-matched when
/// the table knows it, estimated otherwise.
pub fn replacement_for(word: &str, match_syllables: bool) -> String {
    let word = word.trim().to_lowercase();

    if let Some((_, replacements)) = syllable_replacements(&word) {
        if !match_syllables {
            if let Some(silly) = silly_replacements(&word) {
                return silly[0].to_string();
            }
        }
        return replacements[0].to_string();
    }

    if let Some(silly) = silly_replacements(&word) {
        return silly[0].to_string();
    }

    syllable_fallbacks(count_syllables(&word))[0].to_string()
}

/// All known replacements for a word (syllable table plus silly table).
pub fn all_replacements(word: &str) -> Vec<String> {
    let word = word.trim().to_lowercase();
    let mut out: Vec<String> = Vec::new();

    if let Some((_, replacements)) = syllable_replacements(&word) {
        out.extend(replacements.iter().map(|s| s.to_string()));
    }
    if let Some(silly) = silly_replacements(&word) {
        for s in silly {
            if !out.iter().any(|existing| existing == s) {
                out.push(s.to_string());
            }
        }
    }
    if out.is_empty() {
        out.push(replacement_for(&word, true));
    }
    out
}

/// Replacement for `matched`, mirroring its capitalisation: all-upper,
/// leading-upper, or lower.
pub fn replacement_mirroring_case(matched: &str) -> String {
    let replacement = replacement_for(matched, true);

    let letters: Vec<char> = matched.chars().filter(|c| c.is_alphabetic()).collect();
    if !letters.is_empty() && letters.iter().all(|c| c.is_uppercase()) {
        replacement.to_uppercase()
    } else if matched.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) {
        let mut chars = replacement.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => replacement,
        }
    } else {
        replacement
    }
}

/// Censored display form: first and last letters kept, middle starred.
pub fn display_form(word: &str) -> String {
    let chars: Vec<char> = word.chars().collect();
    if chars.len() <= 2 {
        return "*".repeat(chars.len());
    }
    let mut out = String::new();
    out.push(chars[0]);
    out.extend(std::iter::repeat('*').take(chars.len() - 2));
    out.push(chars[chars.len() - 1]);
    out
}
