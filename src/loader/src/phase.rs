/// A load phase is both a staging subdirectory and a timing bucket.
///
/// `Libs` load first and unconditionally, `EarlyMods` before engine init,
/// `Mods` after the first scene. Dependency search walks from the current
/// phase back towards `Libs`, never forwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadPhase {
    None,
    Libs,
    EarlyMods,
    Mods,
}

impl LoadPhase {
    pub const STAGED: [LoadPhase; 3] = [LoadPhase::Libs, LoadPhase::EarlyMods, LoadPhase::Mods];

    pub fn dir(self) -> &'static str {
        match self {
            LoadPhase::None => "",
            LoadPhase::Libs => "libs",
            LoadPhase::EarlyMods => "early_mods",
            LoadPhase::Mods => "mods",
        }
    }

    /// Phases to consult when resolving a dependency of an object in
    /// `self`, in search order: the object's own phase first, then each
    /// earlier phase down to `Libs`.
    pub fn search_order(self) -> impl Iterator<Item = LoadPhase> {
        LoadPhase::STAGED
            .into_iter()
            .rev()
            .skip_while(move |p| *p > self)
    }
}

impl From<LoadPhase> for u8 {
    fn from(phase: LoadPhase) -> u8 {
        match phase {
            LoadPhase::None => 0,
            LoadPhase::Libs => 1,
            LoadPhase::EarlyMods => 2,
            LoadPhase::Mods => 3,
        }
    }
}
