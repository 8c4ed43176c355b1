//! Notice and label strings for the three supported locales.
//! Lookups fall back to French when a key is missing from the active table.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Fr,
    En,
    Es,
}

impl Locale {
    /// Parses a locale tag such as `en` or `es-ES`. Anything unknown is `fr`.
    pub fn from_tag(tag: &str) -> Self {
        let primary = tag.trim().split(['-', '_']).next().unwrap_or_default();
        match primary.to_ascii_lowercase().as_str() {
            "en" => Locale::En,
            "es" => Locale::Es,
            _ => Locale::Fr,
        }
    }

    fn table(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Locale::Fr => FR,
            Locale::En => EN,
            Locale::Es => ES,
        }
    }
}

/// Looks `key` up in the active locale, then in French. Unknown keys come
/// back unchanged so a missing string is visible rather than blank.
pub fn translate(locale: Locale, key: &str) -> String {
    lookup(locale.table(), key)
        .or_else(|| lookup(FR, key))
        .unwrap_or(key)
        .to_string()
}

fn lookup(table: &'static [(&'static str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

const FR: &[(&str, &str)] = &[
    ("meetings.title", "Réunions du jour"),
    ("meetings.noMeetings", "Aucune réunion prévue aujourd'hui"),
    ("meetings.loading", "Chargement des réunions..."),
    ("meetings.cached", "Données en cache utilisées"),
    ("meetings.error", "Échec du chargement des données"),
    ("meetings.updated", "Réunions mises à jour en direct !"),
    ("meetings.connectionError", "Connexion temps réel indisponible"),
    ("meetings.serverError", "Erreur serveur"),
    ("races.noRaces", "Aucune course."),
    ("participants.loading", "Chargement des sélections..."),
    ("participants.noSelections", "Aucune sélection pour cette course."),
    ("participants.updated", "Sélections mises à jour"),
    ("participants.favori", "Favori"),
    ("participants.tocard", "Tocard"),
    ("participants.watched", "Surveillé"),
    ("odds.none", "Aucune cote disponible pour cette course."),
];

const EN: &[(&str, &str)] = &[
    ("meetings.title", "Today's Meetings"),
    ("meetings.noMeetings", "No meetings scheduled today"),
    ("meetings.loading", "Loading meetings..."),
    ("meetings.cached", "Using cached data"),
    ("meetings.error", "Failed to load data"),
    ("meetings.updated", "Reunions updated live!"),
    ("meetings.connectionError", "Live connection unavailable"),
    ("meetings.serverError", "Server error"),
    ("races.noRaces", "No races."),
    ("participants.loading", "Loading selections..."),
    ("participants.noSelections", "No selections for this race."),
    ("participants.updated", "Selections updated"),
    ("participants.favori", "Favorite"),
    ("participants.tocard", "Outsider"),
    ("participants.watched", "Watched"),
    ("odds.none", "No odds available for this race."),
];

const ES: &[(&str, &str)] = &[
    ("meetings.title", "Reuniones de hoy"),
    ("meetings.noMeetings", "No hay reuniones programadas hoy"),
    ("meetings.loading", "Cargando reuniones..."),
    ("meetings.cached", "Usando datos en caché"),
    ("meetings.error", "Error al cargar los datos"),
    ("meetings.updated", "¡Reuniones actualizadas en directo!"),
    ("races.noRaces", "Sin carreras."),
    ("participants.loading", "Cargando selecciones..."),
    ("participants.noSelections", "Sin selecciones para esta carrera."),
    ("participants.favori", "Favorito"),
    ("participants.tocard", "Outsider"),
    ("participants.watched", "Vigilado"),
    ("odds.none", "No hay cuotas disponibles para esta carrera."),
];
