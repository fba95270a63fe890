use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 対話の話者
///
/// コールセンター通話の話者種別。ラベル付け段階でLLMが付与した
/// ラベルから判定される。`Agent` / `Customer` 以外のラベルは
/// `Other` としてそのまま保持する。
///
/// # Examples
///
/// ```
/// # use call_audit::types::Speaker;
/// let speaker = Speaker::from_label("agent", "Agent", "Customer");
/// assert_eq!(speaker, Speaker::Agent);
///
/// let speaker = Speaker::from_label("Supervisor", "Agent", "Customer");
/// assert_eq!(speaker, Speaker::Other("Supervisor".to_string()));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Speaker {
    /// オペレーター（応対者）
    Agent,
    /// 顧客
    Customer,
    /// その他のラベル（ナレーション、不明話者など）
    Other(String),
}

impl Speaker {
    /// ラベル文字列から話者を判定
    ///
    /// 大文字小文字は区別しない。`agent_label` / `customer_label` は
    /// 設定で変更できるため引数で受け取る。
    pub fn from_label(label: &str, agent_label: &str, customer_label: &str) -> Self {
        let trimmed = label.trim();
        if trimmed.eq_ignore_ascii_case(agent_label) {
            Speaker::Agent
        } else if trimmed.eq_ignore_ascii_case(customer_label) {
            Speaker::Customer
        } else {
            Speaker::Other(trimmed.to_string())
        }
    }

    /// 表示用ラベル
    pub fn label(&self) -> &str {
        match self {
            Speaker::Agent => "Agent",
            Speaker::Customer => "Customer",
            Speaker::Other(name) => name,
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 対話の1ターン（1発話）
///
/// ラベル付き対話ファイルの1行に対応する。
#[derive(Clone, Debug, PartialEq)]
pub struct DialogueTurn {
    /// 話者
    pub speaker: Speaker,
    /// 発話テキスト
    pub text: String,
}

impl DialogueTurn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

impl fmt::Display for DialogueTurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.speaker, self.text)
    }
}

/// 固定サイズの会話チャンク
///
/// 採点の単位。連続するターンを固定数ずつまとめたもの。
/// チャンク番号は1始まり（CSVの `Chunk` 列に対応）。
#[derive(Clone, Debug)]
pub struct DialogueChunk {
    /// チャンク番号（1始まり）
    pub index: usize,
    /// このチャンクに含まれるターン
    pub turns: Vec<DialogueTurn>,
}

impl DialogueChunk {
    /// 採点プロンプトへ埋め込む会話テキスト
    ///
    /// `話者: 発話` 形式の行を改行で連結する。
    pub fn prompt_text(&self) -> String {
        self.turns
            .iter()
            .map(|turn| turn.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// ターン数
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// コンプライアンス判定
///
/// チャンク単位の判定と監査全体の判定の両方に使う。
/// LLMの出力は表記が揺れることがあるため、パースは大文字小文字を
/// 区別しない。シリアライズはチャンク行では `Pass`/`Warn`/`Fail`、
/// 監査全体（FINAL行）では `PASS`/`WARN`/`FAIL` を使う。
///
/// # Examples
///
/// ```
/// # use call_audit::types::Verdict;
/// assert_eq!(Verdict::parse("Pass"), Some(Verdict::Pass));
/// assert_eq!(Verdict::parse("FAIL"), Some(Verdict::Fail));
/// assert_eq!(Verdict::parse("unknown"), None);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// 違反なし
    Pass,
    /// 軽微な問題あり
    Warn,
    /// 明確な違反あり
    Fail,
}

impl Verdict {
    /// 文字列から判定をパース（大文字小文字を区別しない）
    pub fn parse(s: &str) -> Option<Verdict> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("pass") {
            Some(Verdict::Pass)
        } else if trimmed.eq_ignore_ascii_case("warn") {
            Some(Verdict::Warn)
        } else if trimmed.eq_ignore_ascii_case("fail") {
            Some(Verdict::Fail)
        } else {
            None
        }
    }

    /// チャンク行用の表記
    pub fn chunk_label(self) -> &'static str {
        match self {
            Verdict::Pass => "Pass",
            Verdict::Warn => "Warn",
            Verdict::Fail => "Fail",
        }
    }

    /// 監査全体（FINAL行）用の表記
    pub fn overall_label(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Warn => "WARN",
            Verdict::Fail => "FAIL",
        }
    }
}

impl Serialize for Verdict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.chunk_label())
    }
}

impl<'de> Deserialize<'de> for Verdict {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Verdict::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown verdict: {}", raw)))
    }
}

/// 1チャンクの採点結果
///
/// 採点LLMが返すJSONオブジェクトに対応する。
/// `violations` / `suggestions` は省略されることがあるため
/// デフォルトで空リストになる。
///
/// # JSON例
///
/// ```json
/// {
///   "empathy": 85,
///   "professionalism": 90,
///   "compliance": "Pass",
///   "reason": "No violations in this chunk",
///   "violations": [],
///   "suggestions": ["Confirm the customer's name earlier"]
/// }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct ChunkScore {
    /// 共感性スコア (1-100)
    pub empathy: f64,
    /// プロフェッショナリズムスコア (1-100)
    pub professionalism: f64,
    /// コンプライアンス判定
    pub compliance: Verdict,
    /// 判定理由
    #[serde(default)]
    pub reason: String,
    /// 検出されたポリシー違反
    #[serde(default)]
    pub violations: Vec<String>,
    /// 改善提案
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// 採点済みチャンク（チャンク番号付き）
#[derive(Clone, Debug)]
pub struct ScoredChunk {
    /// チャンク番号（1始まり）
    pub index: usize,
    /// 採点結果
    pub score: ChunkScore,
}

/// 監査全体の集計結果
///
/// CSVのFINAL行とコンソールサマリの元になる。
#[derive(Clone, Debug)]
pub struct AuditSummary {
    /// 共感性スコアの平均
    pub mean_empathy: f64,
    /// プロフェッショナリズムスコアの平均
    pub mean_professionalism: f64,
    /// 監査全体の判定（Fail優先、次にWarn）
    pub overall: Verdict,
    /// 重複排除済みの違反一覧（初出順）
    pub violations: Vec<String>,
    /// 重複排除済みの改善提案一覧（初出順）
    pub suggestions: Vec<String>,
    /// 採点されたチャンク数
    pub chunks_scored: usize,
}
