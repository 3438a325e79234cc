//! 置換表エントリー
//!
//! TtEntry: 10バイトのコンパクトなエントリ構造
//! TtData: 読み取り用のデータ構造
//!
//! フィールド順（ワイヤ上もこの順）:
//!
//! | offset | 型  | 内容 |
//! |--------|-----|------|
//! | 0      | u16 | key16（64bitキーの上位16bit、0 は空エントリ） |
//! | 2      | u16 | move16 |
//! | 4      | i16 | value16 |
//! | 6      | i16 | eval16 |
//! | 8      | u8  | generation(6bit) \| bound(2bit) |
//! | 9      | i8  | depth8 |

use super::{DEPTH_SLACK, GENERATION_CYCLE, GENERATION_MASK};
use crate::types::{Bound, Depth, Move, Value};

/// エントリのバイト幅
pub const ENTRY_BYTES: usize = 10;

/// 64bitキーからクラスター内照合用の16bitを取り出す
#[inline]
pub const fn key16_of(key: u64) -> u16 {
    (key >> 48) as u16
}

/// 置換表エントリー
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub struct TtEntry {
    /// ハッシュキーの上位16bit（0 は空）
    key16: u16,
    /// 最善手（16bit形式）
    move16: u16,
    /// 探索値
    value16: i16,
    /// 評価値
    eval16: i16,
    /// generation(6bit) | bound(2bit)
    gen_bound8: u8,
    /// 探索深さ
    depth8: i8,
}

impl TtEntry {
    /// 空のエントリ
    pub const EMPTY: TtEntry = TtEntry::new();

    #[inline]
    pub const fn new() -> Self {
        Self {
            key16: 0,
            move16: 0,
            value16: 0,
            eval16: 0,
            gen_bound8: 0,
            depth8: 0,
        }
    }

    /// 生のフィールドから組み立てる（テストやデコード用）
    #[inline]
    pub const fn from_parts(
        key16: u16,
        move16: u16,
        value16: i16,
        eval16: i16,
        gen_bound8: u8,
        depth8: i8,
    ) -> Self {
        Self {
            key16,
            move16,
            value16,
            eval16,
            gen_bound8,
            depth8,
        }
    }

    /// 空エントリか（key16 == 0 を空と定義する）
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.key16 == 0
    }

    #[inline]
    pub fn key16(&self) -> u16 {
        self.key16
    }

    #[inline]
    pub fn depth8(&self) -> i8 {
        self.depth8
    }

    #[inline]
    pub fn gen_bound8(&self) -> u8 {
        self.gen_bound8
    }

    /// 格納されている世代（下位2bitを落とした値）
    #[inline]
    pub fn generation(&self) -> u8 {
        self.gen_bound8 & GENERATION_MASK
    }

    #[inline]
    pub fn bound(&self) -> Bound {
        Bound::from_u8(self.gen_bound8 & 0x3).unwrap_or(Bound::None)
    }

    /// エントリを読み取る
    pub fn read(&self) -> TtData {
        TtData {
            mv: Move::from_u16(self.move16),
            value: Value::new(self.value16 as i32),
            eval: Value::new(self.eval16 as i32),
            depth: self.depth8 as Depth,
            bound: self.bound(),
        }
    }

    /// エントリに保存
    ///
    /// この関数は探索のホットパスで呼ばれるため、構造体にまとめず個別の引数で受け取る。
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &mut self,
        key: u64,
        value: Value,
        bound: Bound,
        depth: Depth,
        mv: Move,
        eval: Value,
        generation8: u8,
    ) {
        let key16 = key16_of(key);

        // 新しい手がない場合は同一局面の古い手を保持
        if !mv.is_none() || key16 != self.key16 {
            self.move16 = mv.to_u16();
        }

        // 上書き条件：
        // - 異なるキー
        // - より深い探索（DEPTH_SLACK の猶予付き）
        // - BOUND_EXACT（確定値）
        if key16 != self.key16 || depth > self.depth8 as i32 - DEPTH_SLACK || bound == Bound::Exact
        {
            debug_assert!((i8::MIN as i32..=i8::MAX as i32).contains(&depth));

            self.key16 = key16;
            self.value16 = value.to_i16();
            self.eval16 = eval.to_i16();
            self.gen_bound8 = (generation8 & GENERATION_MASK) | bound as u8;
            self.depth8 = depth.clamp(i8::MIN as i32, i8::MAX as i32) as i8;
        }
    }

    /// 世代だけを現在値に更新する（Bound の下位2bitは保持）
    #[inline]
    pub fn refresh(&mut self, generation8: u8) {
        self.gen_bound8 = (generation8 & GENERATION_MASK) | (self.gen_bound8 & 0x3);
    }

    /// 相対的な世代（0 = 最新、4刻み）
    ///
    /// 256 + 3 を足してから下位2bitを落とすので、generation8 が一周しても
    /// 実際の経過世代数で並ぶ。
    #[inline]
    pub fn relative_age(&self, generation8: u8) -> i32 {
        (GENERATION_CYCLE + generation8 as i32 - self.gen_bound8 as i32) & GENERATION_MASK as i32
    }

    /// 置換価値 = depth8 - relative_age * 2
    ///
    /// 局所的な置換と、ノード間マージの順位付けの両方に使う。
    #[inline]
    pub fn replace_value(&self, generation8: u8) -> i32 {
        self.depth8 as i32 - self.relative_age(generation8) * 2
    }

    /// 固定レイアウトで `out[..ENTRY_BYTES]` に書き出す
    #[inline]
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.key16.to_le_bytes());
        out[2..4].copy_from_slice(&self.move16.to_le_bytes());
        out[4..6].copy_from_slice(&self.value16.to_le_bytes());
        out[6..8].copy_from_slice(&self.eval16.to_le_bytes());
        out[8] = self.gen_bound8;
        out[9] = self.depth8 as u8;
    }

    /// 固定レイアウトの `bytes[..ENTRY_BYTES]` から読み出す
    #[inline]
    pub fn decode_from(bytes: &[u8]) -> Self {
        Self {
            key16: u16::from_le_bytes([bytes[0], bytes[1]]),
            move16: u16::from_le_bytes([bytes[2], bytes[3]]),
            value16: i16::from_le_bytes([bytes[4], bytes[5]]),
            eval16: i16::from_le_bytes([bytes[6], bytes[7]]),
            gen_bound8: bytes[8],
            depth8: bytes[9] as i8,
        }
    }
}

/// 置換表から読み取ったデータ
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtData {
    /// 最善手
    pub mv: Move,
    /// 探索値
    pub value: Value,
    /// 評価値
    pub eval: Value,
    /// 探索深さ
    pub depth: Depth,
    /// 境界タイプ
    pub bound: Bound,
}

impl TtData {
    /// 空のデータ
    pub const EMPTY: Self = Self {
        mv: Move::NONE,
        value: Value::NONE,
        eval: Value::NONE,
        depth: 0,
        bound: Bound::None,
    };
}

impl Default for TtData {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: u64 = 0x1234_0000_0000_0001;

    #[test]
    fn test_tt_entry_new() {
        let entry = TtEntry::new();
        assert!(entry.is_empty());
        assert_eq!(entry.key16(), 0);
    }

    #[test]
    fn test_tt_entry_save_and_read() {
        let mut entry = TtEntry::new();
        let mv = Move::from_u16(0x0abc);

        entry.save(KEY, Value::new(100), Bound::Exact, 10, mv, Value::new(-50), 8);

        assert!(!entry.is_empty());
        assert_eq!(entry.key16(), 0x1234);

        let data = entry.read();
        assert_eq!(data.value.raw(), 100);
        assert_eq!(data.eval.raw(), -50);
        assert_eq!(data.depth, 10);
        assert_eq!(data.bound, Bound::Exact);
        assert_eq!(data.mv, mv);
        assert_eq!(entry.generation(), 8);
    }

    #[test]
    fn test_tt_entry_keeps_move_on_null_resave() {
        let mut entry = TtEntry::new();
        let mv = Move::from_u16(77);
        entry.save(KEY, Value::new(10), Bound::Lower, 6, mv, Value::ZERO, 0);

        // 同一局面・指し手なしの再保存では手を保持する
        entry.save(KEY, Value::new(20), Bound::Lower, 8, Move::NONE, Value::ZERO, 0);
        assert_eq!(entry.read().mv, mv);
        assert_eq!(entry.read().value.raw(), 20);

        // 別局面なら指し手なしでも上書きされる
        entry.save(0x9999_0000_0000_0000, Value::new(1), Bound::Upper, 1, Move::NONE, Value::ZERO, 0);
        assert_eq!(entry.read().mv, Move::NONE);
    }

    #[test]
    fn test_tt_entry_depth_slack() {
        let mut entry = TtEntry::new();
        entry.save(KEY, Value::new(10), Bound::Lower, 12, Move::NONE, Value::ZERO, 0);

        // 12 - 4 = 8 を超えない浅い結果は値を上書きしない
        entry.save(KEY, Value::new(99), Bound::Upper, 8, Move::NONE, Value::ZERO, 0);
        assert_eq!(entry.read().value.raw(), 10);
        assert_eq!(entry.read().depth, 12);

        // 猶予内（9 > 8）なら上書きする
        entry.save(KEY, Value::new(55), Bound::Upper, 9, Move::NONE, Value::ZERO, 0);
        assert_eq!(entry.read().value.raw(), 55);
        assert_eq!(entry.read().depth, 9);
        assert_eq!(entry.read().bound, Bound::Upper);
    }

    #[test]
    fn test_tt_entry_exact_always_wins() {
        let mut entry = TtEntry::new();
        entry.save(KEY, Value::new(10), Bound::Lower, 30, Move::NONE, Value::ZERO, 0);
        entry.save(KEY, Value::new(-3), Bound::Exact, 1, Move::NONE, Value::ZERO, 4);
        let data = entry.read();
        assert_eq!(data.value.raw(), -3);
        assert_eq!(data.depth, 1);
        assert_eq!(data.bound, Bound::Exact);
        assert_eq!(entry.generation(), 4);
    }

    #[test]
    fn test_tt_entry_refresh_keeps_bound() {
        let mut entry = TtEntry::new();
        entry.save(KEY, Value::ZERO, Bound::Upper, 3, Move::NONE, Value::ZERO, 12);
        entry.refresh(40);
        assert_eq!(entry.generation(), 40);
        assert_eq!(entry.bound(), Bound::Upper);
    }

    #[test]
    fn test_tt_entry_relative_age() {
        let mut entry = TtEntry::new();
        entry.save(KEY, Value::ZERO, Bound::Lower, 10, Move::NONE, Value::ZERO, 8);

        // 同じ世代では0
        assert_eq!(entry.relative_age(8), 0);
        // 世代が進むと4刻みでageが増える（GENERATION_DELTA = 4）
        assert_eq!(entry.relative_age(12), 4);
        assert_eq!(entry.replace_value(12), 10 - 8);
    }

    #[test]
    fn test_tt_entry_relative_age_across_wrap() {
        // Exact（下位2bit = 3）でも世代252のエントリは 0 → 4 と正しく老化する
        let entry = TtEntry::from_parts(1, 0, 0, 0, 252 | Bound::Exact as u8, 20);
        assert_eq!(entry.relative_age(252), 0);
        assert_eq!(entry.relative_age(0), 4);
        assert_eq!(entry.relative_age(4), 8);
    }

    #[test]
    fn test_tt_entry_byte_layout() {
        let entry = TtEntry::from_parts(0xA1B2, 0x0304, -2, 0x0506, 0xFB, -7);
        let mut bytes = [0u8; ENTRY_BYTES];
        entry.encode_into(&mut bytes);
        assert_eq!(bytes, [0xB2, 0xA1, 0x04, 0x03, 0xFE, 0xFF, 0x06, 0x05, 0xFB, 0xF9]);
        assert_eq!(TtEntry::decode_from(&bytes), entry);
    }

    #[test]
    fn test_tt_data_empty() {
        let data = TtData::EMPTY;
        assert_eq!(data.mv, Move::NONE);
        assert_eq!(data.bound, Bound::None);
    }
}
