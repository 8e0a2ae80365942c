use rustc_hash::FxHashMap;

#[derive(Default)]
pub(crate) struct LatchedFlags {
    flags: FxHashMap<u32, bool>,
}

impl LatchedFlags {
    pub fn set(&mut self, line: u32, value: bool) {
        self.flags.insert(line, value);
    }

    pub fn get_and_clear(&mut self, line: u32) -> bool {
        match self.flags.get_mut(&line) {
            Some(flag) => std::mem::take(flag),
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.flags.clear();
    }
}
