//! Client encoding names to the encoding names written into COPY directives.
//!
//! Postgres matches encoding names loosely (case and punctuation are ignored),
//! so the names returned here, such as `utf_8`, `iso8859_1` or `win1252`, are
//! accepted by the server as long as they normalise to one of its own names.

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Encoding {0} has no postgres equivalent")]
pub struct EncodingNotSupported(pub String);

/// Known aliases (normalised: lowercase, alphanumerics only) and the name used
/// in the directive.
const ENCODINGS: &[(&[&str], &str)] = &[
    (&["utf8", "utf", "u8", "unicode", "cp65001"], "utf_8"),
    (&["ascii", "usascii", "sqlascii", "646", "us"], "sql_ascii"),
    (&["latin1", "latin", "l1", "iso88591", "88591", "cp819", "iso885911987"], "iso8859_1"),
    (&["latin2", "l2", "iso88592", "iso885921987"], "iso8859_2"),
    (&["latin3", "l3", "iso88593", "iso885931988"], "iso8859_3"),
    (&["latin4", "l4", "iso88594", "iso885941988"], "iso8859_4"),
    (&["cyrillic", "iso88595", "iso885951988"], "iso8859_5"),
    (&["arabic", "iso88596", "iso885961987"], "iso8859_6"),
    (&["greek", "greek8", "iso88597", "iso885971987"], "iso8859_7"),
    (&["hebrew", "iso88598", "iso885981988"], "iso8859_8"),
    (&["latin5", "l5", "iso88599", "iso885991989"], "iso8859_9"),
    (&["latin6", "l6", "iso885910", "iso8859101992"], "iso8859_10"),
    (&["latin7", "l7", "iso885913"], "iso8859_13"),
    (&["latin8", "l8", "iso885914", "iso8859141998"], "iso8859_14"),
    (&["latin9", "l9", "iso885915"], "iso8859_15"),
    (&["latin10", "l10", "iso885916", "iso8859162001"], "iso8859_16"),
    (&["cp866", "866", "ibm866", "win866", "alt"], "win866"),
    (&["cp874", "win874"], "win874"),
    (&["cp1250", "windows1250", "win1250"], "win1250"),
    (&["cp1251", "windows1251", "win1251", "win"], "win1251"),
    (&["cp1252", "windows1252", "win1252"], "win1252"),
    (&["cp1253", "windows1253", "win1253"], "win1253"),
    (&["cp1254", "windows1254", "win1254"], "win1254"),
    (&["cp1255", "windows1255", "win1255"], "win1255"),
    (&["cp1256", "windows1256", "win1256"], "win1256"),
    (&["cp1257", "windows1257", "win1257"], "win1257"),
    (&["cp1258", "windows1258", "win1258", "abc", "tcvn", "tcvn5712"], "win1258"),
    (&["koi8r", "koi8"], "koi8_r"),
    (&["koi8u"], "koi8_u"),
    (&["big5", "big5tw", "csbig5"], "big5"),
    (&["gbk", "936", "cp936", "ms936"], "gbk"),
    (&["gb18030", "gb180302000"], "gb18030"),
    (&["euccn", "gb2312", "eucgb2312cn"], "euc_cn"),
    (&["eucjp", "ujis", "uujis"], "euc_jp"),
    (&["eucjis2004", "eucjisx0213"], "euc_jis_2004"),
    (&["euckr", "korean", "ksc5601", "ksx1001"], "euc_kr"),
    (&["cp949", "949", "ms949", "uhc"], "uhc"),
    (&["johab", "cp1361", "ms1361"], "johab"),
    (&["shiftjis", "sjis", "csshiftjis", "mskanji", "cp932", "ms932"], "shift_jis"),
    (&["shiftjis2004", "sjis2004", "shiftjisx0213"], "shift_jis_2004"),
];

fn normalize_encoding(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii_alphanumeric()).map(|c| c.to_ascii_lowercase()).collect()
}

/// Translates a client encoding name (`utf8`, `UTF-8`, `latin1`, ...) into the
/// name embedded in the COPY directive.
pub fn get_postgres_encoding(encoding: &str) -> Result<&'static str, EncodingNotSupported> {
    let normalized = normalize_encoding(encoding);

    ENCODINGS
        .iter()
        .find(|(aliases, _)| aliases.contains(&normalized.as_str()))
        .map(|(_, postgres_name)| *postgres_name)
        .ok_or_else(|| EncodingNotSupported(encoding.to_string()))
}
