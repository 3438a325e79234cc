//! 置換表が格納する値の型
//!
//! 指し手生成や局面表現は探索側の責務なので、ここでは置換表エントリーに
//! 詰め込む値（評価値・境界・16bit指し手・深さ）だけを定義する。

/// 評価値
///
/// 値のスケールは探索側に合わせる。置換表には16bitに切り詰めて格納する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Value(i32);

impl Value {
    /// ゼロ
    pub const ZERO: Value = Value(0);
    /// 無効値（static eval 未計算など）
    pub const NONE: Value = Value(32002);

    /// 値から生成
    #[inline]
    pub const fn new(v: i32) -> Value {
        Value(v)
    }

    /// 生の値を取得
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// 16bitに収まるよう飽和させた値
    #[inline]
    pub(crate) fn to_i16(self) -> i16 {
        self.0.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }
}

/// 探索深さ（plies、整数単位）
pub type Depth = i32;

/// 境界タイプ
///
/// `gen_bound8` の下位2bitに格納される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Bound {
    #[default]
    None = 0,
    /// 上界（fail low）
    Upper = 1,
    /// 下界（fail high）
    Lower = 2,
    /// 確定値
    Exact = 3,
}

impl Bound {
    /// 下位2bitから復元
    #[inline]
    pub const fn from_u8(v: u8) -> Option<Bound> {
        match v {
            0 => Some(Bound::None),
            1 => Some(Bound::Upper),
            2 => Some(Bound::Lower),
            3 => Some(Bound::Exact),
            _ => None,
        }
    }
}

/// 16bit形式の指し手
///
/// 中身の解釈は探索側が行う。0 は「指し手なし」。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Move(u16);

impl Move {
    /// 指し手なし
    pub const NONE: Move = Move(0);

    #[inline]
    pub const fn from_u16(v: u16) -> Move {
        Move(v)
    }

    #[inline]
    pub const fn to_u16(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}
