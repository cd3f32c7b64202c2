//! Assainissement des identifiants (noms de tables et de colonnes)
//!
//! Produit des identifiants `[a-z_][a-z0-9_]*` déterministes et hors mots réservés
//! PostgreSQL. Les lettres latines étendues et cyrilliques sont translittérées.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::Feature;

/// Longueur maximale d'un identifiant PostgreSQL (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Mots-clés réservés et colonnes système (triés pour la recherche dichotomique)
const RESERVED: &[&str] = &[
    "action",
    "all",
    "analyse",
    "analyze",
    "and",
    "any",
    "array",
    "as",
    "asc",
    "asymmetric",
    "authorization",
    "between",
    "binary",
    "both",
    "case",
    "cast",
    "check",
    "cmax",
    "cmin",
    "collate",
    "column",
    "constraint",
    "controller",
    "create",
    "cross",
    "ctid",
    "current_date",
    "current_role",
    "current_time",
    "current_timestamp",
    "current_user",
    "default",
    "deferrable",
    "desc",
    "distinct",
    "do",
    "else",
    "end",
    "except",
    "false",
    "for",
    "foreign",
    "format",
    "freeze",
    "from",
    "full",
    "grant",
    "group",
    "having",
    "ilike",
    "in",
    "initially",
    "inner",
    "intersect",
    "into",
    "is",
    "isnull",
    "join",
    "leading",
    "left",
    "like",
    "limit",
    "localtime",
    "localtimestamp",
    "natural",
    "new",
    "not",
    "notnull",
    "null",
    "off",
    "offset",
    "ogc_fid",
    "oid",
    "old",
    "on",
    "only",
    "or",
    "order",
    "outer",
    "overlaps",
    "placing",
    "primary",
    "references",
    "right",
    "select",
    "session_user",
    "similar",
    "some",
    "symmetric",
    "table",
    "tableoid",
    "then",
    "to",
    "trailing",
    "true",
    "union",
    "unique",
    "user",
    "using",
    "verbose",
    "when",
    "where",
    "xmax",
    "xmin",
];

fn tag_pattern() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"))
}

fn entity_pattern() -> &'static Regex {
    static ENTITY: OnceLock<Regex> = OnceLock::new();
    ENTITY.get_or_init(|| Regex::new(r"&.+?;").expect("static regex"))
}

/// Vérifie si un identifiant est un mot réservé
pub fn is_reserved(ident: &str) -> bool {
    RESERVED.binary_search(&ident).is_ok()
}

/// Équivalent ASCII (minuscule) d'une lettre accentuée ou cyrillique
fn transliterate(c: char) -> Option<&'static str> {
    let out = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => "a",
        'æ' | 'Æ' => "ae",
        'ç' | 'ć' | 'č' | 'ĉ' | 'ċ' | 'Ç' | 'Ć' | 'Č' | 'Ĉ' | 'Ċ' => "c",
        'ď' | 'đ' | 'Ď' | 'Đ' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' | 'ĕ' | 'ė' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ę' | 'Ě' | 'Ĕ' | 'Ė' => "e",
        'ƒ' | 'Ƒ' => "f",
        'ĝ' | 'ğ' | 'ġ' | 'ģ' | 'Ĝ' | 'Ğ' | 'Ġ' | 'Ģ' => "g",
        'ĥ' | 'ħ' | 'Ĥ' | 'Ħ' => "h",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ĩ' | 'ĭ' | 'į' | 'ı' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Ĩ' | 'Ĭ' | 'Į' => "i",
        'ĳ' | 'Ĳ' => "ij",
        'ĵ' | 'Ĵ' => "j",
        'ķ' | 'ĸ' | 'Ķ' => "k",
        'ł' | 'ľ' | 'ĺ' | 'ļ' | 'ŀ' | 'Ł' | 'Ľ' | 'Ĺ' | 'Ļ' | 'Ŀ' => "l",
        'ñ' | 'ń' | 'ň' | 'ņ' | 'ŉ' | 'ŋ' | 'Ñ' | 'Ń' | 'Ň' | 'Ņ' | 'Ŋ' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' | 'ŏ' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' | 'Ŏ' => "o",
        'œ' | 'Œ' => "oe",
        'ŕ' | 'ř' | 'ŗ' | 'Ŕ' | 'Ř' | 'Ŗ' => "r",
        'ś' | 'š' | 'ş' | 'ŝ' | 'ș' | 'Ś' | 'Š' | 'Ş' | 'Ŝ' | 'Ș' => "s",
        'ß' => "ss",
        'ť' | 'ţ' | 'ŧ' | 'ț' | 'Ť' | 'Ţ' | 'Ŧ' | 'Ț' => "t",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ŭ' | 'ũ' | 'ų' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' | 'Ŭ' | 'Ũ' | 'Ų' => "u",
        'ŵ' | 'Ŵ' => "w",
        'ý' | 'ÿ' | 'ŷ' | 'Ý' | 'Ÿ' | 'Ŷ' => "y",
        'ž' | 'ż' | 'ź' | 'Ž' | 'Ż' | 'Ź' => "z",
        // Cyrillique (GOST 7.79 B simplifié)
        'а' | 'А' => "a",
        'б' | 'Б' => "b",
        'в' | 'В' => "v",
        'г' | 'Г' => "g",
        'д' | 'Д' => "d",
        'е' | 'Е' => "e",
        'ё' | 'Ё' => "yo",
        'ж' | 'Ж' => "zh",
        'з' | 'З' => "z",
        'и' | 'И' => "i",
        'й' | 'Й' => "j",
        'к' | 'К' => "k",
        'л' | 'Л' => "l",
        'м' | 'М' => "m",
        'н' | 'Н' => "n",
        'о' | 'О' => "o",
        'п' | 'П' => "p",
        'р' | 'Р' => "r",
        'с' | 'С' => "s",
        'т' | 'Т' => "t",
        'у' | 'У' => "u",
        'ф' | 'Ф' => "f",
        'х' | 'Х' => "x",
        'ц' | 'Ц' => "cz",
        'ч' | 'Ч' => "ch",
        'ш' | 'Ш' => "sh",
        'щ' | 'Щ' => "shh",
        'ы' | 'Ы' => "y",
        'э' | 'Э' => "e",
        'ю' | 'Ю' => "yu",
        'я' | 'Я' => "ya",
        _ => return None,
    };
    Some(out)
}

/// Transforme une chaîne arbitraire en identifiant sûr
///
/// Fonction pure : la même entrée donne toujours la même sortie.
pub fn sanitize(input: &str) -> String {
    let stripped = tag_pattern().replace_all(input, "");

    let mut lowered = String::with_capacity(stripped.len());
    for c in stripped.chars() {
        match transliterate(c) {
            Some(ascii) => lowered.push_str(ascii),
            None => lowered.extend(c.to_lowercase()),
        }
    }

    let lowered = entity_pattern().replace_all(&lowered, " ");

    // Tout caractère hors [a-z0-9_] devient un séparateur ; les séparateurs
    // consécutifs se réduisent à un seul `_`, sans `_` en tête ni en queue.
    let mut out = String::with_capacity(lowered.len());
    let mut pending_separator = false;
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(c);
        } else {
            pending_separator = true;
        }
    }

    let bad_start = out
        .chars()
        .next()
        .is_some_and(|c| !(c.is_ascii_lowercase() || c == '_'));
    if bad_start || is_reserved(&out) {
        out.insert(0, '_');
    }

    out
}

/// Tronque à `max` octets sans couper de caractère
pub fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Résout le nom de table cible à partir de la saisie de l'appelant
///
/// Ce nom fait foi pour toute la durée d'un chargement.
pub fn resolve_table_name(raw: &str) -> String {
    let name = sanitize(raw);
    let name = match name.chars().next() {
        Some(c) if c.is_ascii_lowercase() => name,
        Some('_') => format!("table{}", name),
        _ => format!("table_{}", name),
    };
    truncate_bytes(&name, MAX_IDENTIFIER_BYTES).to_string()
}

/// Cache d'assainissement propre à un chargement
///
/// Borné : vidé lorsqu'il atteint sa capacité, les clés venant de la source.
#[derive(Debug)]
pub struct Sanitizer {
    cache: HashMap<String, String>,
    capacity: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl Sanitizer {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Assainit une clé en passant par le cache
    pub fn sanitize(&mut self, key: &str) -> String {
        if let Some(hit) = self.cache.get(key) {
            return hit.clone();
        }
        if self.cache.len() >= self.capacity {
            self.cache.clear();
        }
        let out = sanitize(key);
        self.cache.insert(key.to_string(), out.clone());
        out
    }

    /// Renomme les attributs d'une feature (la dernière clé en collision l'emporte)
    pub fn sanitize_feature(&mut self, mut feature: Feature) -> Feature {
        let properties = std::mem::take(&mut feature.properties);
        for (key, value) in properties {
            let key = self.sanitize(&key);
            feature.properties.insert(key, value);
        }
        feature
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
