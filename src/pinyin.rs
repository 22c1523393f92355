use std::sync::LazyLock;

use rustc_hash::FxHashSet;

// 常见拼音音节表 / legal pinyin syllables, grouped by initial. Hand
// maintained; the tail holds whole brand words that resolve as one unit.
static SYLLABLES: &[&str] = &[
    // b
    "ba", "bo", "bi", "bu", "bai", "bei", "bao", "ban", "ben", "bang", "beng", "bian", "biao",
    "bie", "bin", "bing",
    // p
    "pa", "po", "pi", "pu", "pai", "pei", "pao", "pou", "pan", "pen", "pang", "peng", "pian",
    "piao", "pie", "pin", "ping",
    // m
    "ma", "mo", "me", "mi", "mu", "mai", "mei", "mao", "mou", "man", "men", "mang", "meng",
    "mian", "miao", "mie", "min", "ming",
    // f
    "fa", "fo", "fu", "fei", "fao", "fou", "fan", "fen", "fang", "feng",
    // d
    "da", "de", "di", "du", "dai", "dei", "dao", "dou", "dan", "den", "dang", "deng", "dian",
    "diao", "die", "ding", "dong", "duan", "dui", "dun",
    // t
    "ta", "te", "ti", "tu", "tai", "tao", "tou", "tan", "tang", "teng", "tian", "tiao", "tie",
    "ting", "tong", "tuan", "tui", "tun",
    // n
    "na", "ne", "ni", "nu", "nai", "nei", "nao", "nou", "nan", "nen", "nang", "neng", "nian",
    "niao", "nie", "nin", "ning", "nong", "nuan",
    // l
    "la", "le", "li", "lu", "lai", "lei", "lao", "lou", "lan", "lang", "leng", "lian", "liao",
    "lie", "lin", "ling", "long", "luan", "lun", "luo",
    // g
    "ga", "ge", "gu", "gai", "gei", "gao", "gou", "gan", "gen", "gang", "geng", "gong", "guan",
    "gui", "gun", "guo",
    // k
    "ka", "ke", "ku", "kai", "kao", "kou", "kan", "ken", "kang", "keng", "kong", "kuan", "kui",
    "kun", "kuo",
    // h
    "ha", "he", "hu", "hai", "hei", "hao", "hou", "han", "hen", "hang", "heng", "hong", "huan",
    "hui", "hun", "huo",
    // j
    "ji", "ju", "jiu", "jie", "jia", "jiao", "jian", "jin", "jiang", "jing", "jiong", "juan",
    "jun",
    // q
    "qi", "qu", "qiu", "qie", "qia", "qiao", "qian", "qin", "qiang", "qing", "qiong", "quan",
    "qun",
    // x
    "xi", "xu", "xiu", "xie", "xia", "xiao", "xian", "xin", "xiang", "xing", "xiong", "xuan",
    "xun",
    // zh
    "zha", "zhe", "zhi", "zhu", "zhai", "zhao", "zhou", "zhan", "zhen", "zhang", "zheng",
    "zhong", "zhuan", "zhui", "zhun", "zhuo",
    // ch
    "cha", "che", "chi", "chu", "chai", "chao", "chou", "chan", "chen", "chang", "cheng",
    "chong", "chuan", "chui", "chun", "chuo",
    // sh
    "sha", "she", "shi", "shu", "shai", "shao", "shou", "shan", "shen", "shang", "sheng",
    "shuai", "shuan", "shui", "shun", "shuo",
    // r
    "ran", "ren", "rang", "reng", "ri", "rao", "rou", "rong", "ruan", "rui", "run", "ruo",
    // z
    "za", "ze", "zi", "zu", "zai", "zao", "zou", "zan", "zen", "zang", "zeng", "zong", "zuan",
    "zui", "zun", "zuo",
    // c
    "ca", "ce", "ci", "cu", "cai", "cao", "cou", "can", "cen", "cang", "ceng", "cong", "cuan",
    "cui", "cun", "cuo",
    // s
    "sa", "se", "si", "su", "sai", "sao", "sou", "san", "sen", "sang", "seng", "song", "suan",
    "sui", "sun", "suo",
    // y
    "ya", "ye", "yi", "yu", "yao", "you", "yan", "yin", "yang", "ying", "yong", "yuan", "yun",
    "yue",
    // w
    "wa", "wo", "wu", "wai", "wei", "wan", "wen", "wang", "weng",
    // 零声母 / zero initial
    "a", "o", "e", "ai", "ei", "ao", "ou", "an", "en", "ang", "eng", "er",
    // 常见中文网站词 / common Chinese site words kept whole
    "taobao", "baidu", "weixin", "zhihu", "youku", "tudou", "alibaba", "alipay", "tencent",
    "douyin", "weibo", "xiami", "huawei", "xiaomi", "pinduoduo", "meituan", "dianping", "ctrip",
    "feiniu", "suning", "guomei", "dangdang", "tianmao", "feishu",
];

static SYLLABLE_SET: LazyLock<FxHashSet<&'static str>> =
    LazyLock::new(|| SYLLABLES.iter().copied().collect());

// 最短/最长音节长度 / syllable length bounds used when splitting
const MIN_SYLLABLE_LEN: usize = 2;
const MAX_SYLLABLE_LEN: usize = 6;
const MAX_WORD_LEN: usize = 30;

/// Heuristic used when no filing API key is configured: a bare label is
/// treated as domestic when it reads as pinyin, either an initials
/// abbreviation or a chain of legal syllables.
pub fn is_pinyin_word(word: &str) -> bool {
    if word.len() < 2 || !word.bytes().all(|b| b.is_ascii_alphabetic()) {
        return false;
    }

    // 拼音缩写一般不超过 4 个字母 / abbreviations stay short
    if word.len() <= 4 && is_initial_abbr(word) {
        return true;
    }

    word.len() <= MAX_WORD_LEN && splits_into_syllables(word)
}

fn is_initial_abbr(word: &str) -> bool {
    word.bytes().all(|b| {
        matches!(
            b,
            b'b' | b'p'
                | b'm'
                | b'f'
                | b'd'
                | b't'
                | b'n'
                | b'l'
                | b'g'
                | b'k'
                | b'h'
                | b'j'
                | b'q'
                | b'x'
                | b'z'
                | b'c'
                | b's'
                | b'r'
                | b'y'
                | b'w'
        )
    })
}

// reachable[i] == true 表示 word[..i] 可以切分 / prefix of length i splits
// cleanly into table syllables.
fn splits_into_syllables(word: &str) -> bool {
    let bytes = word.as_bytes();
    let mut reachable = vec![false; bytes.len() + 1];
    reachable[0] = true;

    for start in 0..bytes.len() {
        if !reachable[start] {
            continue;
        }
        for len in MIN_SYLLABLE_LEN..=MAX_SYLLABLE_LEN.min(bytes.len() - start) {
            let piece = &word[start..start + len];
            if SYLLABLE_SET.contains(piece) {
                reachable[start + len] = true;
            }
        }
    }

    reachable[bytes.len()]
}
