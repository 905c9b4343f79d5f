use crate::model::LogEntry;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const TOP_GENRES: usize = 5;
const TOP_DIRECTORS: usize = 5;
const TOP_COUNTRIES: usize = 10;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Tally {
    pub name: String,
    pub count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Stats {
    pub total_watched: usize,
    pub this_year_watched: usize,
    /// Mean of non-zero ratings, one decimal.
    pub avg_rating: f64,
    pub total_hours: u64,
    pub lists_count: usize,
    pub top_genres: Vec<Tally>,
    pub top_directors: Vec<Tally>,
    pub top_countries: Vec<Tally>,
    /// January first.
    pub films_per_month: [u32; 12],
}

/// Counts names in the order they are first seen.
#[derive(Default)]
struct Tallies {
    counts: Vec<Tally>,
    index: HashMap<String, usize>,
}

impl Tallies {
    fn add(&mut self, name: &str) {
        match self.index.get(name) {
            Some(&i) => self.counts[i].count += 1,
            None => {
                self.index.insert(name.to_owned(), self.counts.len());
                self.counts.push(Tally {
                    name: name.to_owned(),
                    count: 1,
                });
            }
        }
    }

    /// Highest counts first; equal counts keep first-seen order.
    fn top(mut self, n: usize) -> Vec<Tally> {
        // sort_by is stable
        self.counts.sort_by(|a, b| b.count.cmp(&a.count));
        self.counts.truncate(n);
        self.counts
    }
}

pub fn compute_stats(logs: &[LogEntry], lists_count: usize, today: NaiveDate) -> Stats {
    let year = today.year();
    let mut this_year_watched = 0;
    let mut films_per_month = [0u32; 12];
    let mut rating_sum = 0.0;
    let mut rated = 0u32;
    let mut minutes = 0u64;
    let mut genres = Tallies::default();
    let mut directors = Tallies::default();
    let mut countries = Tallies::default();

    for log in logs {
        if log.watched_date.year() == year {
            this_year_watched += 1;
            films_per_month[log.watched_date.month0() as usize] += 1;
        }
        if log.rating > 0.0 {
            rating_sum += log.rating;
            rated += 1;
        }
        minutes += u64::from(log.movie.runtime.unwrap_or(0));
        for genre in &log.movie.genres {
            genres.add(genre);
        }
        if let Some(director) = &log.movie.director {
            directors.add(director);
        }
        for country in &log.movie.countries {
            countries.add(country);
        }
    }

    let avg_rating = if rated == 0 {
        0.0
    } else {
        (rating_sum / f64::from(rated) * 10.0).round() / 10.0
    };

    Stats {
        total_watched: logs.len(),
        this_year_watched,
        avg_rating,
        total_hours: (minutes as f64 / 60.0).round() as u64,
        lists_count,
        top_genres: genres.top(TOP_GENRES),
        top_directors: directors.top(TOP_DIRECTORS),
        top_countries: countries.top(TOP_COUNTRIES),
        films_per_month,
    }
}

/// Consecutive days ending today with at least one log.
///
/// The streak is strict: a day counts only when every day between it and
/// today has a log too, and a streak with no log today is 0. Several logs on
/// one day count once. Logs dated after today are ignored.
pub fn compute_streak(logs: &[LogEntry], today: NaiveDate) -> u32 {
    let mut dates: Vec<NaiveDate> = logs.iter().map(|log| log.watched_date).collect();
    dates.sort_by(|a, b| b.cmp(a));
    let mut streak = 0i64;
    for date in dates {
        let offset = today.signed_duration_since(date).num_days();
        if offset < 0 || offset < streak {
            continue;
        }
        if offset == streak {
            streak += 1;
        } else {
            break;
        }
    }
    streak as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::test_movie;
    use crate::model::*;
    use chrono::{Duration, Utc};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    fn entry(date: NaiveDate, rating: f64, movie: MovieSnapshot) -> LogEntry {
        LogEntry {
            id: format!("{}", date),
            owner: "u1".to_owned(),
            movie,
            watched_date: date,
            rating,
            review: None,
            tags: Vec::new(),
            visibility: Visibility::Public,
            rewatch: false,
            created_at: Utc::now(),
        }
    }

    fn on(days_ago: i64) -> LogEntry {
        entry(today() - Duration::days(days_ago), 0.0, test_movie(1, "x"))
    }

    fn with(genres: &[&str], director: Option<&str>, countries: &[&str]) -> MovieSnapshot {
        let mut movie = test_movie(1, "x");
        movie.genres = genres.iter().map(|s| s.to_string()).collect();
        movie.director = director.map(str::to_owned);
        movie.countries = countries.iter().map(|s| s.to_string()).collect();
        movie
    }

    #[test]
    fn empty_logs() {
        let stats = compute_stats(&[], 0, today());
        assert_eq!(stats.total_watched, 0);
        assert_eq!(stats.avg_rating, 0.0);
        assert_eq!(stats.total_hours, 0);
        assert_eq!(stats.films_per_month, [0; 12]);
        assert!(stats.top_genres.is_empty());
        assert_eq!(compute_streak(&[], today()), 0);
    }

    #[test]
    fn streak_breaks_on_gap() {
        let three = vec![on(0), on(1), on(2)];
        assert_eq!(compute_streak(&three, today()), 3);
        let gap = vec![on(0), on(2)];
        assert_eq!(compute_streak(&gap, today()), 1);
    }

    #[test]
    fn streak_is_strict() {
        // nothing today
        assert_eq!(compute_streak(&[on(1), on(2)], today()), 0);
        // same day twice counts once
        assert_eq!(compute_streak(&[on(0), on(0), on(1), on(3)], today()), 2);
        // future logs do not start a streak
        assert_eq!(compute_streak(&[on(-1), on(0)], today()), 1);
    }

    #[test]
    fn ratings_skip_unrated() {
        let logs = vec![
            entry(today(), 4.0, test_movie(1, "a")),
            entry(today(), 0.0, test_movie(2, "b")),
            entry(today(), 3.5, test_movie(3, "c")),
            entry(today(), 3.5, test_movie(4, "d")),
        ];
        let stats = compute_stats(&logs, 2, today());
        // (4 + 3.5 + 3.5) / 3 = 3.666..
        assert_eq!(stats.avg_rating, 3.7);
        assert_eq!(stats.lists_count, 2);
        // four films of 120 minutes
        assert_eq!(stats.total_hours, 8);
    }

    #[test]
    fn hours_round_to_nearest() {
        let mut short = test_movie(1, "short");
        short.runtime = Some(89);
        let mut none = test_movie(2, "unknown");
        none.runtime = None;
        let logs = vec![entry(today(), 0.0, short), entry(today(), 0.0, none)];
        assert_eq!(compute_stats(&logs, 0, today()).total_hours, 1);
    }

    #[test]
    fn top_lists_break_ties_by_first_seen() {
        let logs = vec![
            entry(today(), 0.0, with(&["Drama", "Crime"], Some("Mann"), &["US"])),
            entry(today(), 0.0, with(&["Horror"], Some("Carpenter"), &["US", "FR"])),
            entry(today(), 0.0, with(&["Crime"], None, &["FR"])),
            entry(today(), 0.0, with(&["Western", "Drama"], Some("Leone"), &["IT"])),
        ];
        let stats = compute_stats(&logs, 0, today());
        fn names(tallies: &[Tally]) -> Vec<String> {
            tallies.iter().map(|t| t.name.clone()).collect()
        }
        assert_eq!(names(&stats.top_genres), vec!["Drama", "Crime", "Horror", "Western"]);
        assert_eq!(stats.top_genres[0].count, 2);
        assert_eq!(names(&stats.top_directors), vec!["Mann", "Carpenter", "Leone"]);
        assert_eq!(names(&stats.top_countries), vec!["US", "FR", "IT"]);
    }

    #[test]
    fn top_lists_are_capped() {
        let genres: Vec<String> = (0..8).map(|i| format!("g{}", i)).collect();
        let genre_refs: Vec<&str> = genres.iter().map(|s| s.as_str()).collect();
        let logs = vec![entry(today(), 0.0, with(&genre_refs, None, &genre_refs))];
        let stats = compute_stats(&logs, 0, today());
        assert_eq!(stats.top_genres.len(), 5);
        assert_eq!(stats.top_countries.len(), 8);
        assert_eq!(stats.top_genres[4].name, "g4");
    }

    #[test]
    fn months_count_this_year_only() {
        let logs = vec![
            entry(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(), 0.0, test_movie(1, "a")),
            entry(NaiveDate::from_ymd_opt(2024, 1, 30).unwrap(), 0.0, test_movie(2, "b")),
            entry(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(), 0.0, test_movie(3, "c")),
            entry(NaiveDate::from_ymd_opt(2023, 5, 1).unwrap(), 0.0, test_movie(4, "d")),
        ];
        let stats = compute_stats(&logs, 0, today());
        assert_eq!(stats.total_watched, 4);
        assert_eq!(stats.this_year_watched, 3);
        assert_eq!(stats.films_per_month, [2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
