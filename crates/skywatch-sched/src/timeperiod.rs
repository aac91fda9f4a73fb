//! Cron-style active windows.
//!
//! Seven space-separated fields: sec min hour day-of-month month
//! day-of-week [year]. A line may carry several `[...]`-bracketed rules,
//! OR-ed together. Months accept `JAN..DEC` or 1..12; weekdays accept
//! `SUN..SAT` or cron numbering 1=Sun..7=Sat (internally 0=Sun..6=Sat).
//! Day fields additionally accept `L`, `nL`, `nW`, `LW`/`WL` and `n#k`.

use jiff::civil::{date, DateTime};

const START_YEAR: i16 = 1970;
const YEAR_SLOTS: usize = 130;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CronError {
    #[error("empty cron expression")]
    Empty,

    #[error("parse {field} error: '{token}'")]
    BadToken { field: &'static str, token: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Sec,
    Min,
    Hour,
    MonthDay,
    Month,
    WeekDay,
    Year,
}

impl Field {
    fn name(&self) -> &'static str {
        match self {
            Field::Sec => "sec",
            Field::Min => "min",
            Field::Hour => "hour",
            Field::MonthDay => "day of month",
            Field::Month => "month",
            Field::WeekDay => "day of week",
            Field::Year => "year",
        }
    }

    fn slots(&self) -> usize {
        match self {
            Field::Sec | Field::Min => 60,
            Field::Hour => 24,
            Field::MonthDay => 32, // 0 unused, days 1..=31
            Field::Month => 12,    // 0..=11
            Field::WeekDay => 7,   // 0=Sun..6=Sat
            Field::Year => YEAR_SLOTS,
        }
    }
}

/// A fixed-size set of admissible values for one field.
#[derive(Debug, Clone)]
struct Bits {
    bits: Vec<bool>,
}

impl Bits {
    fn new(slots: usize) -> Self {
        Self {
            bits: vec![false; slots],
        }
    }

    fn set(&mut self, n: i32) -> bool {
        let ok = n >= 0 && (n as usize) < self.bits.len();
        if ok {
            self.bits[n as usize] = true;
        }
        ok
    }

    fn set_all(&mut self) -> bool {
        self.bits.fill(true);
        true
    }

    fn set_by_step(&mut self, begin: i32, step: i32) -> bool {
        if begin < 0 || begin as usize >= self.bits.len() || step <= 0 {
            return false;
        }
        let mut pos = begin as usize;
        while pos < self.bits.len() {
            self.bits[pos] = true;
            pos += step as usize;
        }
        true
    }

    fn test(&self, n: i32) -> bool {
        n >= 0 && (n as usize) < self.bits.len() && self.bits[n as usize]
    }
}

/// Special day predicates, evaluated against the month's calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DayRule {
    /// `nL` in day-of-month: the n-th-to-last day (`L` is n = 1).
    MonthLast(i32),
    /// `nW`: the working day nearest to day n within the month.
    MonthNearestWeekday(i32),
    /// `LW` / `WL`: the last working days of the month.
    MonthLastWorkday,
    /// `nL` in day-of-week: the last weekday n of the month (0=Sun).
    WeekLast(i32),
    /// `n#k`: the k-th weekday n of the month.
    WeekNth { weekday: i32, nth: i32 },
}

/// Day-of-week and day numbering for one month: `month_day[d]` is the
/// weekday of day `d` (1=Mon..7=Sun), `week_day[row][wd]` the day number
/// of weekday `wd` in calendar row `row`.
#[derive(Debug)]
struct MonthlyCalendar {
    day_num: i32,
    week_num: usize,
    month_day: [i32; 32],
    week_day: [[i32; 8]; 6],
}

impl MonthlyCalendar {
    fn build(year: i16, month: i8) -> Self {
        let first = date(year, month, 1);
        let day_num = first.days_in_month() as i32;

        let mut month_day = [-1i32; 32];
        // 1=Mon..7=Sun
        let mut weekday = first.weekday().to_monday_one_offset() as i32;
        for day in 1..=day_num {
            month_day[day as usize] = weekday;
            weekday = if weekday == 7 { 1 } else { weekday + 1 };
        }

        let mut week_day = [[-1i32; 8]; 6];
        let mut week = 0usize;
        for day in 1..=day_num {
            let wd = month_day[day as usize] as usize;
            week_day[week][wd] = day;
            if wd == 7 && day != day_num {
                week += 1;
            }
        }

        Self {
            day_num,
            week_num: week,
            month_day,
            week_day,
        }
    }

    /// Is `day` the n-th-to-last day of the month (n from 1)?
    fn is_nth_last_day(&self, day: i32, n: i32) -> bool {
        day == self.day_num - n + 1
    }

    /// Is `day` the last weekday `n` (0=Sun..6=Sat) of the month?
    fn is_last_weekday(&self, day: i32, n: i32) -> bool {
        let wd = if n == 0 { 7 } else { n };
        self.month_day[day as usize] == wd && day + 7 > self.day_num
    }

    /// Is `day` the `nth` weekday `weekday` (0=Sun..6=Sat) of the month?
    fn is_nth_weekday(&self, day: i32, nth: i32, weekday: i32) -> bool {
        let wd = if weekday == 0 { 7 } else { weekday };
        let mut row = nth - 1;
        if row < 0 || row as usize > self.week_num || !(1..=7).contains(&wd) {
            return false;
        }
        // a first row without this weekday shifts every ordinal down one
        if self.week_day[0][wd as usize] <= 0 {
            row += 1;
        }
        row as usize <= self.week_num && self.week_day[row as usize][wd as usize] == day
    }

    /// Is `day` the working day nearest to `target` within this month?
    fn is_nearest_workday(&self, day: i32, target: i32) -> bool {
        if target < 1 || target > self.day_num {
            return false;
        }
        let resolved = match self.month_day[target as usize] {
            1..=5 => target,
            // Saturday: the Friday before, unless that leaves the month
            6 => {
                if target > 1 {
                    target - 1
                } else {
                    target + 2
                }
            }
            // Sunday: the Monday after, unless the month ends here
            7 => {
                if target < self.day_num {
                    target + 1
                } else {
                    target - 2
                }
            }
            _ => return false,
        };
        day == resolved
    }

    /// Is `day` one of the last seven days and a working day?
    fn is_last_workday(&self, day: i32) -> bool {
        (1..=self.day_num).contains(&day)
            && self.day_num < day + 7
            && (1..=5).contains(&self.month_day[day as usize])
    }
}

/// One bracketed rule: six or seven field bitsets plus any day predicates.
#[derive(Debug, Clone)]
struct TimeSlice {
    sec: Bits,
    min: Bits,
    hour: Bits,
    month_day: Bits,
    month: Bits,
    week_day: Bits,
    year: Bits,
    month_day_rules: Vec<DayRule>,
    week_day_rules: Vec<DayRule>,
}

impl TimeSlice {
    fn new() -> Self {
        Self {
            sec: Bits::new(Field::Sec.slots()),
            min: Bits::new(Field::Min.slots()),
            hour: Bits::new(Field::Hour.slots()),
            month_day: Bits::new(Field::MonthDay.slots()),
            month: Bits::new(Field::Month.slots()),
            week_day: Bits::new(Field::WeekDay.slots()),
            year: Bits::new(Field::Year.slots()),
            month_day_rules: Vec::new(),
            week_day_rules: Vec::new(),
        }
    }

    fn matches(&self, dt: DateTime) -> bool {
        let needs_calendar = !self.month_day_rules.is_empty() || !self.week_day_rules.is_empty();
        let calendar = if needs_calendar {
            Some(MonthlyCalendar::build(dt.year(), dt.month()))
        } else {
            None
        };

        let day = dt.day() as i32;
        // 0=Sun..6=Sat
        let weekday = dt.date().weekday().to_sunday_zero_offset() as i32;

        let day_rule_hit = |rules: &[DayRule]| {
            let Some(cal) = &calendar else { return false };
            rules.iter().any(|rule| match rule {
                DayRule::MonthLast(n) => cal.is_nth_last_day(day, *n),
                DayRule::MonthNearestWeekday(n) => cal.is_nearest_workday(day, *n),
                DayRule::MonthLastWorkday => cal.is_last_workday(day),
                DayRule::WeekLast(n) => cal.is_last_weekday(day, *n),
                DayRule::WeekNth { weekday, nth } => cal.is_nth_weekday(day, *nth, *weekday),
            })
        };

        self.hour.test(dt.hour() as i32)
            && self.min.test(dt.minute() as i32)
            && self.sec.test(dt.second() as i32)
            && (self.week_day.test(weekday) || day_rule_hit(&self.week_day_rules))
            && (self.month_day.test(day) || day_rule_hit(&self.month_day_rules))
            && self.month.test(dt.month() as i32 - 1)
            && self.year.test(dt.year() as i32 - START_YEAR as i32)
    }
}

/// A parsed cron expression: the OR of its bracketed rules.
#[derive(Debug, Clone, Default)]
pub struct TimePeriod {
    slices: Vec<TimeSlice>,
}

impl TimePeriod {
    pub fn parse(expr: &str) -> Result<TimePeriod, CronError> {
        if expr.trim().is_empty() {
            return Err(CronError::Empty);
        }

        let mut slices = Vec::new();
        for rule in expr.split(['\r', '\n', '[', ']']) {
            let rule = rule.trim();
            if rule.is_empty() {
                continue;
            }
            slices.push(parse_slice(rule)?);
        }

        if slices.is_empty() {
            return Err(CronError::Empty);
        }
        Ok(TimePeriod { slices })
    }

    pub fn matches_datetime(&self, dt: DateTime) -> bool {
        self.slices.iter().any(|slice| slice.matches(dt))
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

fn parse_slice(rule: &str) -> Result<TimeSlice, CronError> {
    let mut slice = TimeSlice::new();
    let mut fields = rule.split_ascii_whitespace();

    let order = [
        Field::Sec,
        Field::Min,
        Field::Hour,
        Field::MonthDay,
        Field::Month,
        Field::WeekDay,
    ];
    for field in order {
        let token = fields.next().ok_or(CronError::BadToken {
            field: field.name(),
            token: String::new(),
        })?;
        parse_field(token, field, &mut slice)?;
    }

    match fields.next() {
        None => {
            slice.year.set_all();
        }
        Some(token) => parse_field(token, Field::Year, &mut slice)?,
    }

    Ok(slice)
}

fn bits_of<'a>(slice: &'a mut TimeSlice, field: Field) -> &'a mut Bits {
    match field {
        Field::Sec => &mut slice.sec,
        Field::Min => &mut slice.min,
        Field::Hour => &mut slice.hour,
        Field::MonthDay => &mut slice.month_day,
        Field::Month => &mut slice.month,
        Field::WeekDay => &mut slice.week_day,
        Field::Year => &mut slice.year,
    }
}

fn parse_field(token: &str, field: Field, slice: &mut TimeSlice) -> Result<(), CronError> {
    let fail = || CronError::BadToken {
        field: field.name(),
        token: token.to_string(),
    };

    for piece in token.split(',') {
        if piece == "*" {
            bits_of(slice, field).set_all();
            return Ok(());
        }
        if piece == "?" {
            if field != Field::MonthDay && field != Field::WeekDay {
                return Err(fail());
            }
            bits_of(slice, field).set_all();
            return Ok(());
        }
        if !parse_piece(piece, field, slice) {
            return Err(fail());
        }
    }
    Ok(())
}

fn parse_piece(piece: &str, field: Field, slice: &mut TimeSlice) -> bool {
    if piece.is_empty() {
        return false;
    }

    // exact number
    if is_digits(piece) {
        let Some(num) = convert_num(field, piece) else {
            return false;
        };
        return bits_of(slice, field).set(num);
    }

    // bare L: last day of month, or Sunday in the weekday field
    if piece.eq_ignore_ascii_case("L") {
        return match field {
            Field::WeekDay => slice.week_day.set(0),
            Field::MonthDay => {
                slice.month_day_rules.push(DayRule::MonthLast(1));
                true
            }
            _ => false,
        };
    }

    // nW: nearest working day
    if let Some(prefix) = strip_suffix_ci(piece, 'W') {
        if piece.eq_ignore_ascii_case("LW") || piece.eq_ignore_ascii_case("WL") {
            if field != Field::MonthDay {
                return false;
            }
            slice.month_day_rules.push(DayRule::MonthLastWorkday);
            return true;
        }
        if field != Field::MonthDay || !is_digits(prefix) {
            return false;
        }
        let Some(num) = convert_num(field, prefix) else {
            return false;
        };
        if num <= 0 || num > 31 {
            return false;
        }
        slice
            .month_day_rules
            .push(DayRule::MonthNearestWeekday(num));
        return true;
    }

    // WL spelled with the L last
    if piece.eq_ignore_ascii_case("WL") {
        if field != Field::MonthDay {
            return false;
        }
        slice.month_day_rules.push(DayRule::MonthLastWorkday);
        return true;
    }

    // nL: n-th-to-last day, or last weekday n
    if let Some(prefix) = strip_suffix_ci(piece, 'L') {
        if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            match field {
                Field::WeekDay => {
                    let num = if is_digits(prefix) {
                        convert_num(field, prefix)
                    } else {
                        convert_key(field, prefix)
                    };
                    let Some(num) = num else { return false };
                    if !(0..=6).contains(&num) {
                        return false;
                    }
                    slice.week_day_rules.push(DayRule::WeekLast(num));
                    return true;
                }
                Field::MonthDay if is_digits(prefix) => {
                    let Some(num) = convert_num(field, prefix) else {
                        return false;
                    };
                    if num <= 0 || num > 31 {
                        return false;
                    }
                    slice.month_day_rules.push(DayRule::MonthLast(num));
                    return true;
                }
                _ => return false,
            }
        }
        return false;
    }

    // n#k: the k-th weekday n of the month
    if let Some((day_part, nth_part)) = piece.split_once('#') {
        if field != Field::WeekDay || !is_digits(nth_part) {
            return false;
        }
        let weekday = if is_digits(day_part) {
            convert_num(field, day_part)
        } else {
            convert_key(field, day_part)
        };
        let Some(weekday) = weekday else { return false };
        if !(0..=6).contains(&weekday) {
            return false;
        }
        let Ok(nth) = nth_part.parse::<i32>() else {
            return false;
        };
        if nth <= 0 || nth > 5 {
            return false;
        }
        slice.week_day_rules.push(DayRule::WeekNth { weekday, nth });
        return true;
    }

    // A-B range (numbers or names, strictly increasing)
    if let Some((lo, hi)) = piece.split_once('-') {
        let parse_bound = |s: &str| {
            if is_digits(s) {
                convert_num(field, s)
            } else {
                convert_key(field, s)
            }
        };
        let (Some(lo), Some(hi)) = (parse_bound(lo), parse_bound(hi)) else {
            return false;
        };
        if lo < 0 || hi <= lo {
            return false;
        }
        for n in lo..=hi {
            if !bits_of(slice, field).set(n) {
                return false;
            }
        }
        return true;
    }

    // A/step or */step
    if let Some((begin_part, step_part)) = piece.split_once('/') {
        if !is_digits(step_part) {
            return false;
        }
        let begin = if begin_part == "*" || begin_part == "0" {
            Some(0)
        } else if is_digits(begin_part) {
            convert_num(field, begin_part)
        } else {
            convert_key(field, begin_part)
        };
        let Some(begin) = begin else { return false };
        let Ok(step) = step_part.parse::<i32>() else {
            return false;
        };
        return bits_of(slice, field).set_by_step(begin, step);
    }

    // bare name (JAN..DEC, SUN..SAT)
    if piece.chars().all(|c| c.is_ascii_alphabetic()) {
        let Some(num) = convert_key(field, piece) else {
            return false;
        };
        return bits_of(slice, field).set(num);
    }

    false
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn strip_suffix_ci(piece: &str, suffix: char) -> Option<&str> {
    let last = piece.chars().last()?;
    if last.eq_ignore_ascii_case(&suffix) {
        Some(&piece[..piece.len() - last.len_utf8()])
    } else {
        None
    }
}

/// A numeric token in field terms: years re-base to 1970, months shift to
/// 0..11, weekdays map 1=Sun..7=Sat onto 0..6.
fn convert_num(field: Field, token: &str) -> Option<i32> {
    let num: i32 = token.parse().ok()?;
    match field {
        Field::Year => Some(num - START_YEAR as i32),
        Field::Month => Some(num - 1),
        Field::WeekDay => {
            if (1..=7).contains(&num) {
                Some(num - 1)
            } else {
                None
            }
        }
        _ => Some(num),
    }
}

/// A named token: month and weekday names only.
fn convert_key(field: Field, token: &str) -> Option<i32> {
    let upper = token.to_ascii_uppercase();
    match field {
        Field::Month => match upper.as_str() {
            "JAN" => Some(0),
            "FEB" => Some(1),
            "MAR" => Some(2),
            "APR" => Some(3),
            "MAY" => Some(4),
            "JUN" => Some(5),
            "JUL" => Some(6),
            "AUG" => Some(7),
            "SEP" => Some(8),
            "OCT" => Some(9),
            "NOV" => Some(10),
            "DEC" => Some(11),
            _ => None,
        },
        Field::WeekDay => match upper.as_str() {
            "SUN" => Some(0),
            "MON" => Some(1),
            "TUE" => Some(2),
            "WED" => Some(3),
            "THU" => Some(4),
            "FRI" => Some(5),
            "SAT" => Some(6),
            _ => None,
        },
        _ => None,
    }
}
